//! Detector lifecycle
//!
//! `Disabled -> Armed` once models and capture are ready, `Armed -> Running`
//! when the user turns mood detection on, back to `Disabled` on toggle-off,
//! explicit mask selection or teardown. Teardown is terminal.

/// Externally visible detector state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DetectorState {
    #[default]
    Disabled,
    Armed,
    Running,
}

impl DetectorState {
    pub fn display_name(&self) -> &'static str {
        match self {
            DetectorState::Disabled => "Off",
            DetectorState::Armed => "Ready",
            DetectorState::Running => "Detecting",
        }
    }
}

/// Lifecycle events fed to [`DetectorMode::apply`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectorEvent {
    /// Models loaded and capture playable
    Ready,
    /// User turned mood detection on
    Enable,
    /// User turned mood detection off
    Disable,
    /// A mask was chosen explicitly
    ExplicitSelection,
    Teardown,
}

/// State plus the bits of history the transitions depend on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DetectorMode {
    state: DetectorState,
    ready: bool,
    enable_requested: bool,
    torn_down: bool,
}

impl DetectorMode {
    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// What the "use mood detection" checkbox should show
    pub fn detection_requested(&self) -> bool {
        self.state == DetectorState::Running || self.enable_requested
    }

    #[must_use]
    pub fn apply(self, event: DetectorEvent) -> Self {
        if self.torn_down {
            return self;
        }

        let mut next = self;
        match event {
            DetectorEvent::Teardown => {
                next.state = DetectorState::Disabled;
                next.enable_requested = false;
                next.torn_down = true;
            }
            DetectorEvent::Ready => {
                next.ready = true;
                if next.state == DetectorState::Disabled {
                    next.state = if next.enable_requested {
                        DetectorState::Running
                    } else {
                        DetectorState::Armed
                    };
                }
                next.enable_requested = false;
            }
            DetectorEvent::Enable => {
                if next.ready {
                    next.state = DetectorState::Running;
                } else {
                    next.enable_requested = true;
                }
            }
            DetectorEvent::Disable | DetectorEvent::ExplicitSelection => {
                if next.state == DetectorState::Running {
                    next.state = DetectorState::Disabled;
                }
                next.enable_requested = false;
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(events: &[DetectorEvent]) -> DetectorMode {
        events
            .iter()
            .fold(DetectorMode::default(), |mode, &event| mode.apply(event))
    }

    #[test]
    fn test_ready_then_enable_runs() {
        let mode = run(&[DetectorEvent::Ready]);
        assert_eq!(mode.state(), DetectorState::Armed);

        let mode = mode.apply(DetectorEvent::Enable);
        assert_eq!(mode.state(), DetectorState::Running);
    }

    #[test]
    fn test_enable_before_ready_is_remembered() {
        let mode = run(&[DetectorEvent::Enable]);
        assert_eq!(mode.state(), DetectorState::Disabled);
        assert!(mode.detection_requested());

        let mode = mode.apply(DetectorEvent::Ready);
        assert_eq!(mode.state(), DetectorState::Running);
    }

    #[test]
    fn test_explicit_selection_disables_running_detector() {
        let mode = run(&[
            DetectorEvent::Ready,
            DetectorEvent::Enable,
            DetectorEvent::ExplicitSelection,
        ]);
        assert_eq!(mode.state(), DetectorState::Disabled);
        assert!(!mode.detection_requested());

        let mode = mode.apply(DetectorEvent::Enable);
        assert_eq!(mode.state(), DetectorState::Running);
    }

    #[test]
    fn test_explicit_selection_leaves_armed_alone() {
        let mode = run(&[DetectorEvent::Ready, DetectorEvent::ExplicitSelection]);
        assert_eq!(mode.state(), DetectorState::Armed);
    }

    #[test]
    fn test_toggle_off_disables() {
        let mode = run(&[DetectorEvent::Ready, DetectorEvent::Enable, DetectorEvent::Disable]);
        assert_eq!(mode.state(), DetectorState::Disabled);
        assert!(mode.is_ready());
    }

    #[test]
    fn test_teardown_is_terminal() {
        let mode = run(&[DetectorEvent::Ready, DetectorEvent::Enable, DetectorEvent::Teardown]);
        assert_eq!(mode.state(), DetectorState::Disabled);
        assert!(mode.is_torn_down());

        let mode = mode.apply(DetectorEvent::Enable).apply(DetectorEvent::Ready);
        assert_eq!(mode.state(), DetectorState::Disabled);
    }
}
