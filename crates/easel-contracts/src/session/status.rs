use serde::{Deserialize, Serialize};

pub const PROGRESS_COMPLETE: u8 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenerationStatus {
    pub is_generating: bool,
    pub progress: u8,
    pub error: Option<String>,
    pub stage: Option<String>,
}

/// Partial update merged into a message's `GenerationStatus`.
///
/// `error` and `stage` are doubly optional: `None` leaves the field alone,
/// `Some(None)` clears it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusPatch {
    pub is_generating: Option<bool>,
    pub progress: Option<u8>,
    pub error: Option<Option<String>>,
    pub stage: Option<Option<String>>,
}

impl StatusPatch {
    pub fn started(progress: u8, stage: &str) -> Self {
        Self {
            is_generating: Some(true),
            progress: Some(progress),
            error: Some(None),
            stage: Some(Some(stage.to_string())),
        }
    }

    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn stage(stage: &str) -> Self {
        Self {
            stage: Some(Some(stage.to_string())),
            ..Self::default()
        }
    }

    pub fn succeeded() -> Self {
        Self {
            is_generating: Some(false),
            progress: Some(PROGRESS_COMPLETE),
            error: Some(None),
            stage: Some(Some("complete".to_string())),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            is_generating: Some(false),
            progress: Some(0),
            error: Some(Some(error.into())),
            stage: Some(Some("failed".to_string())),
        }
    }
}

impl GenerationStatus {
    pub fn queued() -> Self {
        Self {
            is_generating: true,
            progress: 0,
            error: None,
            stage: Some("queued".to_string()),
        }
    }

    /// Merges a patch. Progress never moves backwards during a
    /// generation, a populated error always ends the generation, and a
    /// settled status only takes progress from a patch that settles or
    /// restarts it.
    pub fn apply(&mut self, patch: &StatusPatch) {
        let was_generating = self.is_generating;
        if let Some(is_generating) = patch.is_generating {
            self.is_generating = is_generating;
        }
        if let Some(error) = &patch.error {
            self.error = error.clone();
        }
        if let Some(stage) = &patch.stage {
            self.stage = stage.clone();
        }
        if let Some(progress) = patch.progress {
            let progress = progress.min(PROGRESS_COMPLETE);
            let restarting = !was_generating && self.is_generating;
            let settling = patch.is_generating == Some(false);
            let advancing = self.is_generating && progress >= self.progress;
            if restarting || settling || advancing {
                self.progress = progress;
            }
        }

        if self.error.is_some() {
            self.is_generating = false;
        } else if self.is_generating && patch.is_generating == Some(true) {
            self.error = None;
        }
    }

    pub fn is_terminal_error(&self) -> bool {
        !self.is_generating && self.error.is_some()
    }

    pub fn is_complete(&self) -> bool {
        !self.is_generating && self.error.is_none() && self.progress == PROGRESS_COMPLETE
    }
}

#[cfg(test)]
mod tests {
    use super::{GenerationStatus, StatusPatch};

    #[test]
    fn progress_is_monotonic_while_generating() {
        let mut status = GenerationStatus::queued();
        status.apply(&StatusPatch::started(15, "preparing"));
        status.apply(&StatusPatch::progress(40));
        status.apply(&StatusPatch::progress(20));
        assert_eq!(status.progress, 40);
        assert!(status.is_generating);
    }

    #[test]
    fn failure_resets_progress_and_stops_generation() {
        let mut status = GenerationStatus::queued();
        status.apply(&StatusPatch::started(15, "preparing"));
        status.apply(&StatusPatch::progress(60));
        status.apply(&StatusPatch::failed("quota exceeded"));
        assert!(!status.is_generating);
        assert_eq!(status.progress, 0);
        assert_eq!(status.error.as_deref(), Some("quota exceeded"));
        assert!(status.is_terminal_error());
    }

    #[test]
    fn error_patch_never_leaves_generating_flag_set() {
        let mut status = GenerationStatus::queued();
        status.apply(&StatusPatch {
            error: Some(Some("boom".to_string())),
            ..StatusPatch::default()
        });
        assert!(!status.is_generating);
        assert!(status.error.is_some());
    }

    #[test]
    fn restart_clears_previous_error() {
        let mut status = GenerationStatus::default();
        status.apply(&StatusPatch::failed("first attempt"));
        status.apply(&StatusPatch::started(15, "preparing"));
        assert!(status.is_generating);
        assert_eq!(status.progress, 15);
        assert_eq!(status.error, None);
    }

    #[test]
    fn success_lands_on_complete() {
        let mut status = GenerationStatus::queued();
        status.apply(&StatusPatch::progress(95));
        status.apply(&StatusPatch::succeeded());
        assert!(status.is_complete());
    }

    #[test]
    fn late_ticks_leave_settled_status_alone() {
        let mut done = GenerationStatus::queued();
        done.apply(&StatusPatch::succeeded());
        done.apply(&StatusPatch::progress(40));
        assert_eq!(done.progress, 100);
        assert!(done.is_complete());

        let mut failed = GenerationStatus::queued();
        failed.apply(&StatusPatch::failed("boom"));
        failed.apply(&StatusPatch::progress(70));
        assert_eq!(failed.progress, 0);
        assert!(failed.is_terminal_error());
    }
}
