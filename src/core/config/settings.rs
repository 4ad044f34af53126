use std::path::PathBuf;

use super::parsing::{
    env_optional, env_or_default, parse_bool, parse_cors_origins, parse_environment, parse_u16,
    parse_u64, parse_usize,
};
use super::types::{
    ApiSettings, ConfigError, CorsSettings, DatabaseSettings, PipelineSettings, RuntimeSettings,
    ServerHost, ServerPort, ServerSettings, Settings, StorageSettings, TelemetrySettings,
};

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("OMR_HOST", "0.0.0.0");
        let port = env_or_default("OMR_PORT", "8000");

        let environment =
            parse_environment(env_optional("OMR_ENV").or_else(|| env_optional("ENVIRONMENT")));

        let project_name = env_or_default("PROJECT_NAME", "OMR Batch API");
        let version = env_or_default("VERSION", env!("CARGO_PKG_VERSION"));
        let api_v1_str = env_or_default("API_V1_STR", "/api/v1");

        let cors_origins = parse_cors_origins(env_optional("BACKEND_CORS_ORIGINS"))?;

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "omrsuperuser");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "omr_db");
        let database_url = env_optional("DATABASE_URL");

        let data_root = PathBuf::from(env_or_default("OMR_DATA_ROOT", "data"));
        let max_archive_size_mb =
            parse_u64("MAX_ARCHIVE_SIZE_MB", env_or_default("MAX_ARCHIVE_SIZE_MB", "2048"))?;

        let worker_count =
            parse_usize("GRADING_WORKER_COUNT", env_or_default("GRADING_WORKER_COUNT", "0"))?;
        let grade_timeout_seconds = parse_u64(
            "GRADE_TIMEOUT_SECONDS",
            env_or_default("GRADE_TIMEOUT_SECONDS", "30"),
        )?;

        let log_level = env_or_default("OMR_LOG_LEVEL", "info");
        let json = env_optional("OMR_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            server: ServerSettings {
                host: ServerHost::parse(host)?,
                port: ServerPort::parse(port)?,
            },
            runtime: RuntimeSettings { environment },
            api: ApiSettings { project_name, version, api_v1_str },
            cors: CorsSettings { origins: cors_origins },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
            },
            storage: StorageSettings { data_root, max_archive_size_mb },
            pipeline: PipelineSettings { worker_count, grade_timeout_seconds },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_env() {
        let settings = Settings::load().expect("settings");
        assert_eq!(settings.api().api_v1_str, "/api/v1");
        assert!(settings.storage().max_archive_size_bytes() >= 2 * 1024 * 1024 * 1024);
        assert!(settings.pipeline().effective_worker_count() >= 1);
    }
}
