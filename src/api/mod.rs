pub(crate) mod batches;
pub(crate) mod errors;
pub(crate) mod handlers;
pub(crate) mod pagination;
pub(crate) mod profiles;
pub(crate) mod router;
pub(crate) mod tasks;
