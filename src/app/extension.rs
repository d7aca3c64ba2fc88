use crate::{application::error::AppError, config::Settings, infra::error::InfraError};

use super::Application;

/// A component that attaches itself to an application.
///
/// The extension object holds construction-time options only; whatever it produces
/// for a given application is stored in that application.
pub trait Extension: Send + Sync {
    /// Registry name; an application binds each name at most once.
    fn name(&self) -> &'static str;

    fn init_app(&self, app: &mut Application) -> Result<(), AppError>;
}

/// Configuration object accepted by the application factories.
pub trait AppConfig {
    fn settings(&self) -> &Settings;

    /// Post-merge hook run once per application.
    fn init_app(&self, _app: &mut Application) -> Result<(), AppError> {
        Ok(())
    }
}

impl AppConfig for Settings {
    fn settings(&self) -> &Settings {
        self
    }

    fn init_app(&self, _app: &mut Application) -> Result<(), AppError> {
        if let Some(dir) = self.logging.warn_log_dir.as_ref() {
            std::fs::create_dir_all(dir).map_err(InfraError::from)?;
        }
        Ok(())
    }
}
