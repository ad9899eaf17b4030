//! The scheduler state machine.
//!
//! Time only moves through [`Scheduler::tick`]. Each tick charges the elapsed
//! interval (CPU to the running process, wait to every Ready one), enforces
//! execution budgets, applies deferred kills, and then decides who runs.
//!
//! Dispatch order: highest effective priority, then longest current wait,
//! then lowest pid. Effective priority is the base priority raised one level
//! per `aging_interval_ms` of waiting, at most `max_boost` levels and never
//! past Realtime.

use std::collections::{BTreeMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SchedError};
use crate::priority::Priority;
use crate::process::{ProcessDescriptor, ProcessId, ProcessState, SpawnOptions};
use crate::trap::{ExitNotice, ExitReason, TrapKind};

/// Aging parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub aging_interval_ms: u64,
    pub max_boost: u8,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            aging_interval_ms: 1000,
            max_boost: 2,
        }
    }
}

/// CPU share of one process relative to its peers at the same base priority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessShare {
    pub pid: ProcessId,
    pub priority: Priority,
    pub cpu_time_ms: u64,
    /// Fraction of its priority group's CPU time this process received.
    pub share: f64,
    /// `1 / group size`.
    pub ideal_share: f64,
    /// `share / ideal_share`.
    pub ratio: f64,
}

/// Snapshot of how evenly CPU time was spread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FairnessReport {
    pub processes: Vec<ProcessShare>,
    /// Lowest ratio across all processes, 1.0 when nothing has run.
    pub min_ratio: f64,
    /// Longest current wait among Ready processes.
    pub max_wait_ms: u64,
}

/// Priority scheduler with aging.
///
/// Not internally synchronized; the kernel keeps it behind a mutex.
#[derive(Debug, Default)]
pub struct Scheduler {
    config: SchedulerConfig,
    procs: BTreeMap<ProcessId, ProcessDescriptor>,
    next_pid: u64,
    running: Option<ProcessId>,
    last_tick: Option<i64>,
    pending_kills: HashSet<ProcessId>,
    exits: VecDeque<ExitNotice>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Current scheduler time: the instant of the last tick.
    pub fn now(&self) -> i64 {
        self.last_tick.unwrap_or(0)
    }

    /// Create a process in the Created state.
    pub fn spawn(&mut self, opts: SpawnOptions) -> ProcessId {
        self.next_pid += 1;
        let pid = ProcessId(self.next_pid);
        info!(%pid, name = %opts.name, priority = %opts.priority, "process spawned");
        self.procs.insert(pid, ProcessDescriptor::new(pid, opts));
        pid
    }

    /// Created → Ready.
    pub fn make_ready(&mut self, pid: ProcessId) -> Result<()> {
        let proc = self.get_mut(pid)?;
        match proc.state {
            ProcessState::Created => {
                proc.state = ProcessState::Ready;
                proc.wait_time_ms = 0;
                Ok(())
            }
            from => Err(SchedError::InvalidTransition {
                pid,
                from,
                op: "make_ready",
            }),
        }
    }

    pub fn descriptor(&self, pid: ProcessId) -> Option<&ProcessDescriptor> {
        self.procs.get(&pid)
    }

    pub fn processes(&self) -> impl Iterator<Item = &ProcessDescriptor> {
        self.procs.values()
    }

    pub fn running(&self) -> Option<ProcessId> {
        self.running
    }

    pub fn find_by_name(&self, name: &str) -> Option<ProcessId> {
        self.procs
            .values()
            .find(|p| p.name == name && !p.state.is_terminal())
            .map(|p| p.id)
    }

    /// Base priority raised by aging.
    pub fn effective_priority(&self, pid: ProcessId) -> Option<Priority> {
        self.procs.get(&pid).map(|p| self.effective_of(p))
    }

    fn effective_of(&self, proc: &ProcessDescriptor) -> Priority {
        let interval = self.config.aging_interval_ms.max(1);
        let levels = (proc.wait_time_ms / interval).min(self.config.max_boost as u64) as u8;
        proc.base_priority.boosted(levels)
    }

    /// Advance time to `now` and make a scheduling decision. Returns the
    /// process that is Running afterwards.
    pub fn tick(&mut self, now: i64) -> Option<ProcessId> {
        let elapsed = self
            .last_tick
            .map_or(0, |last| now.saturating_sub(last).max(0) as u64);
        self.last_tick = Some(now.max(self.now()));

        self.charge(elapsed);

        if let Some(pid) = self.running {
            if self.pending_kills.remove(&pid) {
                self.finish(pid, ExitReason::Killed);
            } else if self.procs.get(&pid).map_or(false, |p| p.budget_exceeded()) {
                warn!(%pid, "execution budget exhausted");
                self.finish(pid, ExitReason::Crashed(TrapKind::Timeout));
            }
        }

        self.decide();
        self.running
    }

    fn charge(&mut self, elapsed: u64) {
        if elapsed == 0 {
            return;
        }
        let running = self.running;
        for proc in self.procs.values_mut() {
            match proc.state {
                ProcessState::Running if Some(proc.id) == running => {
                    proc.cpu_time_ms += elapsed;
                    proc.slice_used_ms += elapsed;
                }
                ProcessState::Ready => {
                    proc.wait_time_ms += elapsed;
                    proc.total_wait_ms += elapsed;
                }
                _ => {}
            }
        }
    }

    fn best_ready(&self) -> Option<(ProcessId, Priority)> {
        self.procs
            .values()
            .filter(|p| p.state == ProcessState::Ready)
            .map(|p| (p, self.effective_of(p)))
            .max_by(|(a, pa), (b, pb)| {
                pa.cmp(pb)
                    .then(a.wait_time_ms.cmp(&b.wait_time_ms))
                    .then(b.id.cmp(&a.id))
            })
            .map(|(p, prio)| (p.id, prio))
    }

    fn decide(&mut self) {
        let Some(running) = self.running else {
            self.dispatch_best();
            return;
        };
        let Some(current) = self.procs.get(&running) else {
            self.running = None;
            self.dispatch_best();
            return;
        };
        if !current.base_priority.is_preemptible() {
            return;
        }
        let current_prio = self.effective_of(current);
        let exhausted = current.slice_exhausted();

        match self.best_ready() {
            Some((candidate, prio)) if prio > current_prio => {
                debug!(preempted = %running, by = %candidate, "preempting");
                self.requeue(running);
                self.dispatch(candidate);
            }
            Some(_) if exhausted => {
                debug!(pid = %running, "slice exhausted");
                self.requeue(running);
                self.dispatch_best();
            }
            _ => {
                if exhausted {
                    if let Some(p) = self.procs.get_mut(&running) {
                        p.slice_used_ms = 0;
                    }
                }
            }
        }
    }

    fn requeue(&mut self, pid: ProcessId) {
        if let Some(p) = self.procs.get_mut(&pid) {
            p.state = ProcessState::Ready;
            p.slice_used_ms = 0;
            p.wait_time_ms = 0;
        }
        if self.running == Some(pid) {
            self.running = None;
        }
    }

    fn dispatch_best(&mut self) {
        if let Some((pid, _)) = self.best_ready() {
            self.dispatch(pid);
        }
    }

    fn dispatch(&mut self, pid: ProcessId) {
        if let Some(p) = self.procs.get_mut(&pid) {
            p.state = ProcessState::Running;
            p.slice_used_ms = 0;
            p.wait_time_ms = 0;
            p.dispatch_count += 1;
            self.running = Some(pid);
        }
    }

    fn get_mut(&mut self, pid: ProcessId) -> Result<&mut ProcessDescriptor> {
        self.procs.get_mut(&pid).ok_or(SchedError::NotFound(pid))
    }

    fn require_running(&self, pid: ProcessId, op: &'static str) -> Result<()> {
        let proc = self.procs.get(&pid).ok_or(SchedError::NotFound(pid))?;
        if proc.state != ProcessState::Running {
            return Err(SchedError::InvalidTransition {
                pid,
                from: proc.state,
                op,
            });
        }
        Ok(())
    }

    /// Running → Ready, giving up the rest of the slice. A pending kill is
    /// applied here instead.
    pub fn yield_now(&mut self, pid: ProcessId) -> Result<()> {
        self.require_running(pid, "yield")?;
        if self.pending_kills.remove(&pid) {
            self.finish(pid, ExitReason::Killed);
        } else {
            self.requeue(pid);
        }
        self.dispatch_best();
        Ok(())
    }

    /// Running → Waiting (blocked on a receive).
    pub fn wait(&mut self, pid: ProcessId) -> Result<()> {
        self.suspend(pid, ProcessState::Waiting, "wait")
    }

    /// Running → Blocked (blocked on I/O).
    pub fn block(&mut self, pid: ProcessId) -> Result<()> {
        self.suspend(pid, ProcessState::Blocked, "block")
    }

    fn suspend(&mut self, pid: ProcessId, to: ProcessState, op: &'static str) -> Result<()> {
        self.require_running(pid, op)?;
        if self.pending_kills.remove(&pid) {
            self.finish(pid, ExitReason::Killed);
        } else {
            let proc = self.get_mut(pid)?;
            proc.state = to;
            proc.slice_used_ms = 0;
            self.running = None;
        }
        self.dispatch_best();
        Ok(())
    }

    /// Waiting or Blocked → Ready. Waking a Ready or Running process is a
    /// no-op.
    pub fn wake(&mut self, pid: ProcessId) -> Result<()> {
        let proc = self.get_mut(pid)?;
        match proc.state {
            ProcessState::Waiting | ProcessState::Blocked => {
                proc.state = ProcessState::Ready;
                proc.wait_time_ms = 0;
                debug!(%pid, "process woken");
                Ok(())
            }
            ProcessState::Ready | ProcessState::Running => Ok(()),
            from => Err(SchedError::InvalidTransition { pid, from, op: "wake" }),
        }
    }

    /// Normal completion.
    pub fn complete(&mut self, pid: ProcessId) -> Result<()> {
        self.terminate(pid, ExitReason::Normal, "complete")
    }

    /// The process faulted. It completes with `Crashed(kind)`; restarting is
    /// the supervisor's call.
    pub fn trap(&mut self, pid: ProcessId, kind: TrapKind) -> Result<()> {
        warn!(%pid, trap = %kind, "process trapped");
        self.terminate(pid, ExitReason::Crashed(kind), "trap")
    }

    /// Kill a process. Immediate unless it is Running, in which case the
    /// kill lands on the next tick or yield.
    pub fn kill(&mut self, pid: ProcessId) -> Result<()> {
        let proc = self.procs.get(&pid).ok_or(SchedError::NotFound(pid))?;
        match proc.state {
            ProcessState::Running => {
                debug!(%pid, "kill deferred");
                self.pending_kills.insert(pid);
                Ok(())
            }
            ProcessState::Completed => Err(SchedError::InvalidTransition {
                pid,
                from: ProcessState::Completed,
                op: "kill",
            }),
            _ => {
                self.finish(pid, ExitReason::Killed);
                Ok(())
            }
        }
    }

    pub fn is_kill_pending(&self, pid: ProcessId) -> bool {
        self.pending_kills.contains(&pid)
    }

    fn terminate(&mut self, pid: ProcessId, reason: ExitReason, op: &'static str) -> Result<()> {
        let proc = self.procs.get(&pid).ok_or(SchedError::NotFound(pid))?;
        if proc.state.is_terminal() {
            return Err(SchedError::InvalidTransition {
                pid,
                from: proc.state,
                op,
            });
        }
        let was_running = self.running == Some(pid);
        self.finish(pid, reason);
        if was_running {
            self.dispatch_best();
        }
        Ok(())
    }

    fn finish(&mut self, pid: ProcessId, reason: ExitReason) {
        let at = self.now();
        self.pending_kills.remove(&pid);
        if self.running == Some(pid) {
            self.running = None;
        }
        if let Some(p) = self.procs.get_mut(&pid) {
            p.state = ProcessState::Completed;
            p.exit_reason = Some(reason);
            info!(%pid, name = %p.name, %reason, "process exited");
            self.exits.push_back(ExitNotice {
                pid,
                name: p.name.clone(),
                reason,
                at,
                cpu_time_ms: p.cpu_time_ms,
            });
        }
    }

    /// Take all queued exit notices, oldest first.
    pub fn drain_exits(&mut self) -> Vec<ExitNotice> {
        self.exits.drain(..).collect()
    }

    /// Forget a Completed process.
    pub fn reap(&mut self, pid: ProcessId) -> Option<ProcessDescriptor> {
        match self.procs.get(&pid) {
            Some(p) if p.state.is_terminal() => self.procs.remove(&pid),
            _ => None,
        }
    }

    /// CPU share of each live process within its base-priority group.
    pub fn fairness_report(&self) -> FairnessReport {
        let live: Vec<&ProcessDescriptor> = self
            .procs
            .values()
            .filter(|p| !p.state.is_terminal() && p.state != ProcessState::Created)
            .collect();

        let mut processes = Vec::with_capacity(live.len());
        for prio in Priority::ALL {
            let group: Vec<&&ProcessDescriptor> =
                live.iter().filter(|p| p.base_priority == prio).collect();
            if group.is_empty() {
                continue;
            }
            let total: u64 = group.iter().map(|p| p.cpu_time_ms).sum();
            let ideal = 1.0 / group.len() as f64;
            for p in group {
                let share = if total == 0 {
                    ideal
                } else {
                    p.cpu_time_ms as f64 / total as f64
                };
                processes.push(ProcessShare {
                    pid: p.id,
                    priority: prio,
                    cpu_time_ms: p.cpu_time_ms,
                    share,
                    ideal_share: ideal,
                    ratio: share / ideal,
                });
            }
        }

        let min_ratio = processes
            .iter()
            .map(|s| s.ratio)
            .fold(1.0_f64, f64::min);
        let max_wait_ms = live
            .iter()
            .filter(|p| p.state == ProcessState::Ready)
            .map(|p| p.wait_time_ms)
            .max()
            .unwrap_or(0);

        FairnessReport {
            processes,
            min_ratio,
            max_wait_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sched() -> Scheduler {
        Scheduler::new(SchedulerConfig::default())
    }

    fn ready(s: &mut Scheduler, name: &str, prio: Priority) -> ProcessId {
        let pid = s.spawn(SpawnOptions::new(name).priority(prio));
        s.make_ready(pid).unwrap();
        pid
    }

    fn run_for(s: &mut Scheduler, start: i64, ms: i64, step: i64) -> i64 {
        let mut t = start;
        while t < start + ms {
            t += step;
            s.tick(t);
        }
        t
    }

    #[test]
    fn test_highest_priority_dispatched_first() {
        let mut s = sched();
        let low = ready(&mut s, "low", Priority::Low);
        let high = ready(&mut s, "high", Priority::High);
        assert_eq!(s.tick(0), Some(high));
        assert_eq!(s.descriptor(low).unwrap().state, ProcessState::Ready);
    }

    #[test]
    fn test_ties_go_to_lowest_pid() {
        let mut s = sched();
        let a = ready(&mut s, "a", Priority::Normal);
        let _b = ready(&mut s, "b", Priority::Normal);
        assert_eq!(s.tick(0), Some(a));
    }

    #[test]
    fn test_slice_rotation_between_equals() {
        let mut s = sched();
        let a = ready(&mut s, "a", Priority::Normal);
        let b = ready(&mut s, "b", Priority::Normal);
        assert_eq!(s.tick(0), Some(a));
        assert_eq!(s.tick(30), Some(a));
        assert_eq!(s.tick(60), Some(b));
        assert_eq!(s.tick(120), Some(a));
    }

    #[test]
    fn test_higher_priority_preempts() {
        let mut s = sched();
        let low = ready(&mut s, "low", Priority::Low);
        assert_eq!(s.tick(0), Some(low));
        let high = ready(&mut s, "high", Priority::High);
        assert_eq!(s.tick(10), Some(high));
        assert_eq!(s.descriptor(low).unwrap().state, ProcessState::Ready);
    }

    #[test]
    fn test_system_never_preempted() {
        let mut s = sched();
        let sys = ready(&mut s, "sys", Priority::System);
        assert_eq!(s.tick(0), Some(sys));
        ready(&mut s, "rt", Priority::Realtime);
        run_for(&mut s, 0, 5_000, 50);
        assert_eq!(s.running(), Some(sys));
        s.complete(sys).unwrap();
        assert_ne!(s.running(), Some(sys));
    }

    #[test]
    fn test_aging_boosts_waiting_process() {
        let mut s = sched();
        let low = ready(&mut s, "low", Priority::Low);
        let high = ready(&mut s, "high", Priority::High);
        assert_eq!(s.tick(0), Some(high));
        s.tick(999);
        assert_eq!(s.effective_priority(low), Some(Priority::Low));
        assert_eq!(s.running(), Some(high));
        s.tick(1_000);
        assert_eq!(s.effective_priority(low), Some(Priority::Normal));
    }

    #[test]
    fn test_low_priority_not_starved() {
        let mut s = sched();
        let low = ready(&mut s, "low", Priority::Low);
        let highs: Vec<ProcessId> = (0..3)
            .map(|i| ready(&mut s, &format!("high-{}", i), Priority::High))
            .collect();
        s.tick(0);
        run_for(&mut s, 0, 10_000, 10);

        let desc = s.descriptor(low).unwrap();
        assert!(desc.cpu_time_ms > 0, "low priority process never ran");
        assert!(desc.dispatch_count >= 2);
        for pid in highs {
            assert!(s.descriptor(pid).unwrap().cpu_time_ms > desc.cpu_time_ms);
        }
    }

    #[test]
    fn test_wait_bounded_by_aging() {
        let mut s = sched();
        ready(&mut s, "low", Priority::Idle);
        for i in 0..4 {
            ready(&mut s, &format!("n{}", i), Priority::Normal);
        }
        s.tick(0);
        let mut t = 0;
        let mut worst = 0;
        for _ in 0..2_000 {
            t += 10;
            s.tick(t);
            worst = worst.max(s.fairness_report().max_wait_ms);
        }
        // two levels of boost lift Idle to Normal, after which rotation is
        // bounded by one slice per peer
        assert!(worst <= 2 * 1000 + 5 * 100, "max wait {}", worst);
    }

    #[test]
    fn test_fairness_ratio_steady_state() {
        let mut s = sched();
        for i in 0..5 {
            ready(&mut s, &format!("w{}", i), Priority::Normal);
        }
        s.tick(0);
        run_for(&mut s, 0, 60_000, 10);
        let report = s.fairness_report();
        assert_eq!(report.processes.len(), 5);
        assert!(report.min_ratio >= 0.8, "ratio {}", report.min_ratio);
    }

    #[test]
    fn test_wait_and_wake() {
        let mut s = sched();
        let a = ready(&mut s, "a", Priority::Normal);
        let b = ready(&mut s, "b", Priority::Normal);
        s.tick(0);
        s.wait(a).unwrap();
        assert_eq!(s.descriptor(a).unwrap().state, ProcessState::Waiting);
        assert_eq!(s.running(), Some(b));
        s.wake(a).unwrap();
        assert_eq!(s.descriptor(a).unwrap().state, ProcessState::Ready);
        assert!(matches!(
            s.wait(a),
            Err(SchedError::InvalidTransition { op: "wait", .. })
        ));
    }

    #[test]
    fn test_block_and_wake() {
        let mut s = sched();
        let a = ready(&mut s, "a", Priority::Normal);
        s.tick(0);
        s.block(a).unwrap();
        assert_eq!(s.running(), None);
        s.wake(a).unwrap();
        assert_eq!(s.tick(5), Some(a));
    }

    #[test]
    fn test_trap_records_crash() {
        let mut s = sched();
        let a = ready(&mut s, "a", Priority::Normal);
        s.tick(0);
        s.trap(a, TrapKind::DivideByZero).unwrap();
        let desc = s.descriptor(a).unwrap();
        assert_eq!(desc.state, ProcessState::Completed);
        assert_eq!(desc.exit_reason, Some(ExitReason::Crashed(TrapKind::DivideByZero)));
        let exits = s.drain_exits();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].reason, ExitReason::Crashed(TrapKind::DivideByZero));
        assert!(s.drain_exits().is_empty());
    }

    #[test]
    fn test_budget_enforced_on_tick() {
        let mut s = sched();
        let a = s.spawn(SpawnOptions::new("a").priority(Priority::System).budget_ms(100));
        s.make_ready(a).unwrap();
        s.tick(0);
        s.tick(50);
        assert_eq!(s.running(), Some(a));
        s.tick(100);
        assert_eq!(
            s.descriptor(a).unwrap().exit_reason,
            Some(ExitReason::Crashed(TrapKind::Timeout))
        );
    }

    #[test]
    fn test_kill_deferred_while_running() {
        let mut s = sched();
        let a = ready(&mut s, "a", Priority::Normal);
        let b = ready(&mut s, "b", Priority::Normal);
        s.tick(0);
        s.kill(a).unwrap();
        assert!(s.is_kill_pending(a));
        assert_eq!(s.descriptor(a).unwrap().state, ProcessState::Running);

        s.kill(b).unwrap();
        assert_eq!(s.descriptor(b).unwrap().exit_reason, Some(ExitReason::Killed));

        s.tick(10);
        assert_eq!(s.descriptor(a).unwrap().exit_reason, Some(ExitReason::Killed));
        assert_eq!(s.running(), None);
        assert!(s.kill(a).is_err());
    }

    #[test]
    fn test_kill_applied_on_yield() {
        let mut s = sched();
        let a = ready(&mut s, "a", Priority::Normal);
        s.tick(0);
        s.kill(a).unwrap();
        s.yield_now(a).unwrap();
        assert_eq!(s.descriptor(a).unwrap().state, ProcessState::Completed);
    }

    #[test]
    fn test_reap_only_completed() {
        let mut s = sched();
        let a = ready(&mut s, "a", Priority::Normal);
        assert!(s.reap(a).is_none());
        s.kill(a).unwrap();
        assert!(s.reap(a).is_some());
        assert!(s.descriptor(a).is_none());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        /// Base priorities within `max_boost` levels of each other, so
        /// aging can always lift the lowest to the top.
        fn spread() -> impl Strategy<Value = Vec<Priority>> {
            (0u8..=2).prop_flat_map(|floor| {
                prop::collection::vec(floor..=floor + 2, 1..6).prop_map(|levels| {
                    levels
                        .into_iter()
                        .filter_map(Priority::from_level)
                        .collect::<Vec<_>>()
                })
            })
        }

        proptest! {
            #[test]
            fn test_no_starvation_within_boost_range(prios in spread()) {
                let mut s = sched();
                let pids: Vec<ProcessId> = prios
                    .iter()
                    .enumerate()
                    .map(|(i, p)| ready(&mut s, &format!("p{}", i), *p))
                    .collect();
                s.tick(0);
                run_for(&mut s, 0, 20_000, 10);

                for pid in pids {
                    prop_assert!(s.descriptor(pid).unwrap().cpu_time_ms > 0, "{} starved", pid);
                }
            }

            #[test]
            fn test_single_running_process(prios in spread(), steps in 1usize..200) {
                let mut s = sched();
                for (i, p) in prios.iter().enumerate() {
                    ready(&mut s, &format!("p{}", i), *p);
                }
                let mut t = 0;
                for _ in 0..steps {
                    t += 7;
                    let running = s.tick(t);
                    let states: Vec<ProcessId> = s
                        .processes()
                        .filter(|p| p.state == ProcessState::Running)
                        .map(|p| p.id)
                        .collect();
                    prop_assert_eq!(states, running.into_iter().collect::<Vec<_>>());
                }
            }
        }
    }
}
