pub(crate) mod archive;
pub(crate) mod export;
pub(crate) mod grading;
pub(crate) mod loader;
pub(crate) mod reconcile;
pub(crate) mod scan;
