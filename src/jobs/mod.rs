pub(crate) mod orchestrator;
pub(crate) mod pool;
pub(crate) mod registry;
