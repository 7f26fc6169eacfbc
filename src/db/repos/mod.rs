mod purge;

pub use purge::*;
