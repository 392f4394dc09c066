//! Script scheduler.
//!
//! Notification and client-reconfiguration scripts run out of process,
//! from a bounded FIFO: at most 256 queued jobs, 16 running at once,
//! 60 seconds of runtime, and up to 10 retries with doubling delay when
//! a script is killed by a signal or asks for a retry with exit code 1.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::events::EventBus;
use super::state::{mstime, PrimaryInstance, SupervisorState};
use super::{SCRIPT_MAX_QUEUE, SCRIPT_MAX_RETRY, SCRIPT_MAX_RUNNING, SCRIPT_MAX_RUNTIME_MS, SCRIPT_RETRY_DELAY_MS};

/// One queued or running script job. `argv[0]` is the script path.
#[derive(Debug)]
pub struct ScriptJob {
    pub argv: Vec<String>,
    pub running: bool,
    pub retry_num: u32,
    /// Earliest start while queued; actual start instant while running.
    pub start_time: u64,
    pub pid: u32,
    child: Option<Child>,
}

/// Read-only job view for the PENDING-SCRIPTS reply.
#[derive(Debug, Clone)]
pub struct ScriptJobView {
    pub argv: Vec<String>,
    pub running: bool,
    pub retry_num: u32,
    pub start_time: u64,
    pub pid: u32,
}

#[derive(Debug)]
pub struct ScriptScheduler {
    queue: Mutex<VecDeque<ScriptJob>>,
    running_scripts: AtomicU32,
}

impl ScriptScheduler {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            running_scripts: AtomicU32::new(0),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn running_count(&self) -> u32 {
        self.running_scripts.load(Ordering::Relaxed)
    }

    fn dec_running(&self) {
        let _ = self
            .running_scripts
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn snapshot(&self) -> Vec<ScriptJobView> {
        self.queue
            .lock()
            .iter()
            .map(|job| ScriptJobView {
                argv: job.argv.clone(),
                running: job.running,
                retry_num: job.retry_num,
                start_time: job.start_time,
                pid: job.pid,
            })
            .collect()
    }

    /// Append a job. When the queue is over the bound the oldest job not
    /// currently running is dropped.
    pub fn schedule(&self, argv: Vec<String>) {
        let mut queue = self.queue.lock();
        queue.push_back(ScriptJob {
            argv,
            running: false,
            retry_num: 0,
            start_time: 0,
            pid: 0,
            child: None,
        });

        if queue.len() > SCRIPT_MAX_QUEUE {
            if let Some(idx) = queue.iter().position(|job| !job.running) {
                queue.remove(idx);
            }
        }
    }

    /// Start queued jobs, oldest first, respecting the concurrency cap and
    /// per-job earliest-start times.
    pub fn run_pending(&self, bus: &EventBus, now: u64) {
        let mut queue = self.queue.lock();

        for job in queue.iter_mut() {
            if self.running_scripts.load(Ordering::Relaxed) >= SCRIPT_MAX_RUNNING {
                break;
            }
            if job.running {
                continue;
            }
            if job.start_time > now {
                continue;
            }

            job.running = true;
            job.start_time = mstime();
            job.retry_num += 1;

            let spawned = Command::new(&job.argv[0])
                .args(&job.argv[1..])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();

            match spawned {
                Ok(child) => {
                    job.pid = child.id();
                    job.child = Some(child);
                    self.running_scripts.fetch_add(1, Ordering::Relaxed);
                    log::debug!("+script-child {}", job.pid);
                }
                Err(_) => {
                    // Spawn failures are reported as signal 99 to unify
                    // reporting with other kinds of errors.
                    script_event(bus, "-script-error", &format!("{} 99 0", job.argv[0]));
                    job.running = false;
                    job.pid = 0;
                }
            }
        }
    }

    /// Reap finished children. Signal-terminated scripts and exit code 1
    /// are requeued with exponential delay while retries remain.
    pub fn collect_terminated(&self, bus: &EventBus) {
        let mut queue = self.queue.lock();
        let mut finished: Vec<usize> = Vec::new();

        for (idx, job) in queue.iter_mut().enumerate() {
            if !job.running {
                continue;
            }
            let Some(child) = job.child.as_mut() else {
                continue;
            };

            let status = match child.try_wait() {
                Ok(Some(status)) => status,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("wait on script pid {} failed: {}", job.pid, e);
                    self.dec_running();
                    finished.push(idx);
                    continue;
                }
            };
            self.dec_running();

            let exitcode = status.code().unwrap_or(0);
            let bysignal = signal_of(&status).unwrap_or(0);
            log::debug!("-script-child {} {} {}", job.pid, exitcode, bysignal);

            if (bysignal != 0 || exitcode == 1) && job.retry_num != SCRIPT_MAX_RETRY {
                job.running = false;
                job.child = None;
                job.pid = 0;
                job.start_time = mstime() + retry_delay(job.retry_num);
            } else {
                if bysignal != 0 || exitcode != 0 {
                    script_event(
                        bus,
                        "-script-error",
                        &format!("{} {} {}", job.argv[0], bysignal, exitcode),
                    );
                }
                finished.push(idx);
            }
        }

        for idx in finished.into_iter().rev() {
            queue.remove(idx);
        }
    }

    /// Force-kill jobs running longer than the allowed runtime. The reap
    /// pass collects them like any signal-terminated script.
    pub fn kill_timedout(&self, bus: &EventBus, now: u64) {
        let mut queue = self.queue.lock();
        for job in queue.iter_mut() {
            if !job.running {
                continue;
            }
            if now.saturating_sub(job.start_time) <= SCRIPT_MAX_RUNTIME_MS {
                continue;
            }
            script_event(
                bus,
                "-script-timeout",
                &format!("{} {}", job.argv[0], job.pid),
            );
            if let Some(child) = job.child.as_mut() {
                let _ = child.kill();
            }
        }
    }
}

impl Default for ScriptScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Delay before the n-th retry: 30s, 60s, 2min, 4min, ...
pub fn retry_delay(retry_num: u32) -> u64 {
    SCRIPT_RETRY_DELAY_MS << retry_num.saturating_sub(1)
}

/// Queue the client reconfiguration script for a failover transition.
///
/// Arguments: `<primary-name> <role> <state> <from-ip> <from-port>
/// <to-ip> <to-port>`, with state one of start, end, abort.
pub fn call_client_reconfig(
    state: &SupervisorState,
    primary: &Arc<PrimaryInstance>,
    role: &str,
    transition: &str,
    from: super::addr::InstanceAddr,
    to: super::addr::InstanceAddr,
) {
    let script = primary.config.read().client_reconfig_script.clone();
    let Some(path) = script else {
        return;
    };
    state.scripts.schedule(vec![
        path.to_string_lossy().into_owned(),
        primary.core.name.clone(),
        role.to_string(),
        transition.to_string(),
        from.ip_string(),
        from.port.to_string(),
        to.ip_string(),
        to.port.to_string(),
    ]);
}

fn script_event(bus: &EventBus, kind: &str, body: &str) {
    log::warn!("{} {}", kind, body);
    bus.publish(kind, body);
}

#[cfg(unix)]
fn signal_of(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles() {
        assert_eq!(retry_delay(1), 30_000);
        assert_eq!(retry_delay(2), 60_000);
        assert_eq!(retry_delay(3), 120_000);
        assert_eq!(retry_delay(4), 240_000);
    }

    #[test]
    fn test_queue_bound_drops_oldest_not_running() {
        let scheduler = ScriptScheduler::new();
        for i in 0..SCRIPT_MAX_QUEUE {
            scheduler.schedule(vec![format!("/bin/script-{}", i)]);
        }
        assert_eq!(scheduler.queue_len(), SCRIPT_MAX_QUEUE);

        // Mark the oldest running so the bound skips over it.
        scheduler.queue.lock()[0].running = true;

        scheduler.schedule(vec!["/bin/script-new".to_string()]);
        let queue = scheduler.queue.lock();
        assert_eq!(queue.len(), SCRIPT_MAX_QUEUE);
        assert_eq!(queue[0].argv[0], "/bin/script-0");
        assert_eq!(queue[1].argv[0], "/bin/script-2");
    }

    #[test]
    fn test_earliest_start_respected() {
        let scheduler = ScriptScheduler::new();
        let bus = EventBus::new();
        scheduler.schedule(vec!["/bin/true".to_string()]);
        scheduler.queue.lock()[0].start_time = mstime() + 60_000;

        scheduler.run_pending(&bus, mstime());
        assert_eq!(scheduler.running_count(), 0);
        assert!(!scheduler.queue.lock()[0].running);
    }

    #[cfg(unix)]
    #[test]
    fn test_successful_script_is_reaped() {
        let scheduler = ScriptScheduler::new();
        let bus = EventBus::new();
        scheduler.schedule(vec!["/bin/true".to_string()]);

        scheduler.run_pending(&bus, mstime());
        assert_eq!(scheduler.running_count(), 1);

        // The child exits almost immediately; poll the reaper.
        for _ in 0..100 {
            scheduler.collect_terminated(&bus);
            if scheduler.queue_len() == 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(scheduler.queue_len(), 0);
        assert_eq!(scheduler.running_count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_code_one_requeues_with_delay() {
        let scheduler = ScriptScheduler::new();
        let bus = EventBus::new();
        scheduler.schedule(vec!["/bin/false".to_string()]);

        scheduler.run_pending(&bus, mstime());
        for _ in 0..100 {
            scheduler.collect_terminated(&bus);
            if scheduler.running_count() == 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        // /bin/false exits 1: requeued, not running, delayed 30s.
        let queue = scheduler.queue.lock();
        assert_eq!(queue.len(), 1);
        assert!(!queue[0].running);
        assert_eq!(queue[0].retry_num, 1);
        assert!(queue[0].start_time > mstime() + 20_000);
    }

    #[cfg(unix)]
    #[test]
    fn test_spawn_failure_emits_synthetic_error() {
        let scheduler = ScriptScheduler::new();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        scheduler.schedule(vec!["/no/such/script".to_string()]);

        scheduler.run_pending(&bus, mstime());
        let event = rx.try_recv().unwrap();
        assert_eq!(event.channel, "-script-error");
        assert!(event.message.ends_with("99 0"));
        assert_eq!(scheduler.running_count(), 0);
    }
}
