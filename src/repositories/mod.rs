pub(crate) mod batches;
pub(crate) mod events;
pub(crate) mod profiles;
pub(crate) mod roster;
pub(crate) mod sheets;
pub(crate) mod stats;
