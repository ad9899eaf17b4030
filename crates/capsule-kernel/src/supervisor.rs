//! Restart decisions for module processes.
//!
//! The scheduler never retries a process. Its exit notices come here, and the
//! supervisor decides whether the module is restarted, at which escalation
//! level and after what delay. Decisions are pure: the caller supplies the
//! current time and carries out the action.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use capsule_kernel_sched::{ExitNotice, ExitReason};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartStrategy {
    /// Restart on any exit.
    #[default]
    Permanent,
    /// Never restart.
    Temporary,
    /// Restart only after a crash.
    Transient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EscalationLevel {
    RestartWithState = 1,
    RestartClean = 2,
    ReloadModule = 3,
    RestartSupervisor = 4,
    RestartSystem = 5,
}

impl EscalationLevel {
    pub fn next(&self) -> Self {
        match self {
            Self::RestartWithState => Self::RestartClean,
            Self::RestartClean => Self::ReloadModule,
            Self::ReloadModule => Self::RestartSupervisor,
            Self::RestartSupervisor | Self::RestartSystem => Self::RestartSystem,
        }
    }

    pub fn level(&self) -> u8 {
        *self as u8
    }

    /// Levels 4 and 5 are beyond what the kernel can do for one module.
    pub fn is_beyond_module(&self) -> bool {
        *self >= Self::RestartSupervisor
    }
}

impl fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.level())
    }
}

/// Restart policy for one supervised module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChildSpec {
    pub restart: RestartStrategy,
    /// Restarts allowed inside one window before escalating.
    pub max_restarts: u32,
    pub restart_window_ms: i64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for ChildSpec {
    fn default() -> Self {
        Self {
            restart: RestartStrategy::Permanent,
            max_restarts: 5,
            restart_window_ms: 60_000,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

impl ChildSpec {
    /// Delay before the `attempt`th restart in a window (1-based).
    pub fn delay_for(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1) as i32;
        let delay = self.base_delay_ms as f64 * self.backoff_factor.powi(exp);
        if !delay.is_finite() {
            return self.max_delay_ms;
        }
        (delay as u64).min(self.max_delay_ms)
    }
}

/// What the kernel should do about an exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    None,
    Restart { level: EscalationLevel, delay_ms: u64 },
    Stop,
    Escalate(EscalationLevel),
}

impl fmt::Display for SupervisorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorAction::None => f.write_str("none"),
            SupervisorAction::Restart { level, delay_ms } => {
                write!(f, "restart({}, {}ms)", level, delay_ms)
            }
            SupervisorAction::Stop => f.write_str("stop"),
            SupervisorAction::Escalate(level) => write!(f, "escalate({})", level),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildStatus {
    pub id: String,
    pub restarts_in_window: u32,
    pub total_exits: u64,
    pub level: EscalationLevel,
    pub stopped: bool,
}

#[derive(Debug, Clone)]
struct ChildState {
    spec: ChildSpec,
    restarts: u32,
    window_start: Option<i64>,
    level: EscalationLevel,
    total_exits: u64,
    stopped: bool,
}

impl ChildState {
    fn new(spec: ChildSpec) -> Self {
        Self {
            spec,
            restarts: 0,
            window_start: None,
            level: EscalationLevel::RestartWithState,
            total_exits: 0,
            stopped: false,
        }
    }

    fn roll_window(&mut self, now: i64) {
        match self.window_start {
            Some(start) if now - start <= self.spec.restart_window_ms => {}
            _ => {
                self.window_start = Some(now);
                self.restarts = 0;
                self.level = EscalationLevel::RestartWithState;
            }
        }
    }
}

/// Tracks restart history per module.
#[derive(Debug, Default)]
pub struct Supervisor {
    default_spec: ChildSpec,
    children: HashMap<String, ChildState>,
}

impl Supervisor {
    pub fn new(default_spec: ChildSpec) -> Self {
        Self {
            default_spec,
            children: HashMap::new(),
        }
    }

    /// Supervise `id` with the default spec.
    pub fn watch(&mut self, id: impl Into<String>) {
        let spec = self.default_spec.clone();
        self.watch_with(id, spec);
    }

    pub fn watch_with(&mut self, id: impl Into<String>, spec: ChildSpec) {
        self.children.insert(id.into(), ChildState::new(spec));
    }

    pub fn unwatch(&mut self, id: &str) -> bool {
        self.children.remove(id).is_some()
    }

    pub fn is_watching(&self, id: &str) -> bool {
        self.children.contains_key(id)
    }

    /// Decide what to do about `notice`. Exits of unknown processes and
    /// deliberate kills are ignored.
    pub fn on_exit(&mut self, notice: &ExitNotice, now: i64) -> SupervisorAction {
        let Some(child) = self.children.get_mut(&notice.name) else {
            return SupervisorAction::None;
        };
        child.total_exits += 1;
        if child.stopped {
            return SupervisorAction::None;
        }

        let trap = match notice.reason {
            ExitReason::Killed => return SupervisorAction::None,
            ExitReason::Normal => {
                if child.spec.restart != RestartStrategy::Permanent {
                    info!(module = %notice.name, "module exited normally");
                    child.stopped = true;
                    return SupervisorAction::Stop;
                }
                None
            }
            ExitReason::Crashed(kind) => {
                if child.spec.restart == RestartStrategy::Temporary {
                    warn!(module = %notice.name, trap = %kind, "temporary module crashed, not restarting");
                    child.stopped = true;
                    return SupervisorAction::Stop;
                }
                Some(kind)
            }
        };

        child.roll_window(now);
        let floor = match trap {
            Some(kind) if !kind.is_recoverable() => EscalationLevel::ReloadModule,
            _ => EscalationLevel::RestartWithState,
        };
        let mut level = if child.restarts == 0 {
            floor
        } else {
            child.level.next().max(floor)
        };
        child.restarts += 1;
        if child.restarts > child.spec.max_restarts {
            level = level.max(EscalationLevel::RestartSupervisor);
        }
        child.level = level;

        if level.is_beyond_module() {
            child.stopped = true;
            error!(module = %notice.name, level = %level, restarts = child.restarts, "restart limit exceeded, escalating");
            return SupervisorAction::Escalate(level);
        }

        let delay_ms = child.spec.delay_for(child.restarts);
        info!(module = %notice.name, level = %level, delay_ms, attempt = child.restarts, "module restart scheduled");
        SupervisorAction::Restart { level, delay_ms }
    }

    pub fn status(&self, id: &str) -> Option<ChildStatus> {
        self.children.get(id).map(|c| ChildStatus {
            id: id.to_string(),
            restarts_in_window: c.restarts,
            total_exits: c.total_exits,
            level: c.level,
            stopped: c.stopped,
        })
    }
}
