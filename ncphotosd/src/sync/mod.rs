pub mod engine;
pub mod fetcher;
pub mod lister;
pub mod paths;
pub mod reconcile;
pub mod transform;
