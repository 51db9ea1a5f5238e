use core::error::Error;

/// Errors surfaced by the provisioning core.
///
/// An admission denial is not an error; it is a negative decision returned as
/// a value.
#[derive(Debug, derive_more::Display)]
pub enum ProvisionError {
    /// Malformed request, rejected before any cluster call
    #[display("Invalid workload request: {message}")]
    Validation { message: String },
    /// Network or permission failure from a cluster primitive
    #[display("Cluster request failed: {message}")]
    Transport { message: String },
    /// A unit failed to create after earlier units of the same plan succeeded
    #[display("Failed to create {unit}")]
    PartialProvision { unit: String },
    /// Compensating delete of an already created unit failed; the object is orphaned
    #[display("Failed to roll back {unit}")]
    RollbackFailed { unit: String },
    /// The raw status payload lacks a field its strategy requires
    #[display("Malformed status for {kind}: {message}")]
    StatusShape { kind: String, message: String },
    /// Provisioning stopped on caller cancellation
    #[display("Provisioning cancelled after creating {created} unit(s)")]
    Cancelled { created: usize },
    #[display("Configuration error: {message}")]
    Config { message: String },
}

impl Error for ProvisionError {}

impl ProvisionError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn status_shape(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StatusShape {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            ProvisionError::validation("image must not be empty").to_string(),
            "Invalid workload request: image must not be empty"
        );
        assert_eq!(
            ProvisionError::status_shape("Notebook.kubeflow.org", "no conditions").to_string(),
            "Malformed status for Notebook.kubeflow.org: no conditions"
        );
        assert_eq!(
            ProvisionError::Cancelled { created: 2 }.to_string(),
            "Provisioning cancelled after creating 2 unit(s)"
        );
    }
}
