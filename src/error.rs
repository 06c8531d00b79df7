use thiserror::Error;

/// Failure taxonomy of the dashboard.
///
/// Model load and source acquisition failures abort the action that caused
/// them and are shown to the user. Tick and persistence failures are handled
/// where they happen and never leave the control loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DashboardError {
    #[error("model load failed: {0}")]
    ModelLoadFailure(String),
    #[error("camera acquisition failed: {0}")]
    CameraAcquisitionFailure(String),
    #[error("remote stream failed: {0}")]
    RemoteStreamFailure(String),
    #[error("detect error: {0}")]
    DetectionTickFailure(String),
    #[error("persisted state unreadable: {0}")]
    PersistenceCorruption(String),
}

impl DashboardError {
    /// True when the failure is absorbed locally and never reaches the user.
    pub fn is_recovered_locally(&self) -> bool {
        matches!(
            self,
            DashboardError::DetectionTickFailure(_) | DashboardError::PersistenceCorruption(_)
        )
    }

    pub(crate) fn model(err: &anyhow::Error) -> Self {
        DashboardError::ModelLoadFailure(format!("{err:#}"))
    }

    pub(crate) fn camera(err: &anyhow::Error) -> Self {
        DashboardError::CameraAcquisitionFailure(format!("{err:#}"))
    }

    pub(crate) fn remote(err: &anyhow::Error) -> Self {
        DashboardError::RemoteStreamFailure(format!("{err:#}"))
    }

    pub(crate) fn tick(err: &anyhow::Error) -> Self {
        DashboardError::DetectionTickFailure(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_tick_and_persistence_failures_are_local() {
        assert!(DashboardError::DetectionTickFailure("x".into()).is_recovered_locally());
        assert!(DashboardError::PersistenceCorruption("x".into()).is_recovered_locally());
        assert!(!DashboardError::ModelLoadFailure("x".into()).is_recovered_locally());
        assert!(!DashboardError::CameraAcquisitionFailure("x".into()).is_recovered_locally());
        assert!(!DashboardError::RemoteStreamFailure("x".into()).is_recovered_locally());
    }

    #[test]
    fn messages_carry_underlying_reason() {
        let err = anyhow::anyhow!("no such device").context("open /dev/video0");
        let msg = DashboardError::camera(&err).to_string();
        assert!(msg.contains("open /dev/video0"));
        assert!(msg.contains("no such device"));
    }
}
