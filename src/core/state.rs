use std::sync::Arc;

use sqlx::PgPool;

use crate::core::config::Settings;
use crate::jobs::registry::JobRegistry;
use crate::services::grading::SheetGrader;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    db: PgPool,
    jobs: JobRegistry,
    grader: Arc<dyn SheetGrader>,
}

impl AppState {
    pub(crate) fn new(settings: Settings, db: PgPool, grader: Arc<dyn SheetGrader>) -> Self {
        Self { inner: Arc::new(InnerState { settings, db, jobs: JobRegistry::new(), grader }) }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn db(&self) -> &PgPool {
        &self.inner.db
    }

    pub(crate) fn jobs(&self) -> &JobRegistry {
        &self.inner.jobs
    }

    pub(crate) fn grader(&self) -> Arc<dyn SheetGrader> {
        self.inner.grader.clone()
    }
}
