mod purge;

pub use purge::PostgresPurgeStore;
