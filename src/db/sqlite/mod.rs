mod purge;

pub use purge::SqlitePurgeStore;
