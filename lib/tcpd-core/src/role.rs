//! Process role state machine.

use std::{
    fmt,
    path::Path,
    sync::{Arc, Mutex},
};

use snafu::{ResultExt as _, Snafu};
use tcpd_error::GenericError;

use crate::application::{Application, ApplicationFactory, ProcessNamer};

/// Default service name used in process titles.
pub const DEFAULT_SERVICE_NAME: &str = "tcpd";

/// Supervisory identity of a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    /// Accepts connections and hands them to workers.
    Master,

    /// Supervises the worker processes.
    Manager,

    /// Serves connections.
    Worker(usize),

    /// Runs background tasks and never receives connections.
    TaskWorker(usize),
}

impl ProcessRole {
    /// Classifies a worker index.
    ///
    /// Indices below `worker_num` are regular workers, and all remaining indices are task workers.
    pub const fn classify(worker_id: usize, worker_num: usize) -> Self {
        if worker_id < worker_num {
            Self::Worker(worker_id)
        } else {
            Self::TaskWorker(worker_id)
        }
    }

    /// Returns `true` if this role hosts an application instance.
    pub const fn hosts_application(&self) -> bool {
        !matches!(self, Self::Master)
    }

    /// Returns the process title for this role.
    pub fn process_title(&self, service: &str, host: &str, port: u16) -> String {
        match self {
            Self::Master => format!("{}: master {}:{}", service, host, port),
            Self::Manager => format!("{}: manager", service),
            Self::Worker(i) => format!("{}: worker #{}", service, i),
            Self::TaskWorker(i) => format!("{}: task #{}", service, i),
        }
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => f.write_str("master"),
            Self::Manager => f.write_str("manager"),
            Self::Worker(i) => write!(f, "worker #{}", i),
            Self::TaskWorker(i) => write!(f, "task #{}", i),
        }
    }
}

/// Role transition errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RoleError {
    /// The process already has a role.
    #[snafu(display("Process role already assigned as {}; refusing to become {}.", current, requested))]
    AlreadyAssigned {
        /// Role the process holds.
        current: ProcessRole,

        /// Role that was requested.
        requested: ProcessRole,
    },

    /// The application for the role could not be created.
    #[snafu(display("Failed to initialize application for {}: {:#}", role, source))]
    InitializationFailed {
        /// Role being entered.
        role: ProcessRole,

        /// Error source.
        source: GenericError,
    },
}

/// Everything needed to enter a role.
pub struct RoleInit<'a> {
    /// Service name used for the process title.
    pub service: &'a str,

    /// Listen host, used for the master title.
    pub host: &'a str,

    /// Listen port, used for the master title.
    pub port: u16,

    /// Application configuration file.
    pub config_file: &'a Path,

    /// Builds the application.
    pub factory: &'a dyn ApplicationFactory,

    /// Sets the process title.
    pub namer: &'a dyn ProcessNamer,
}

enum RoleSlot {
    Unstarted,
    Assigned {
        role: ProcessRole,
        application: Option<Arc<dyn Application>>,
    },
}

/// Role state of a single process.
///
/// The state moves from unstarted to assigned exactly once and never moves back.
pub struct RoleState {
    slot: Mutex<RoleSlot>,
}

impl RoleState {
    /// Creates a new, unstarted `RoleState`.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(RoleSlot::Unstarted),
        }
    }

    /// Assigns `role` to this process and runs its one-time initialization.
    ///
    /// Initialization sets the process title and, for every role but the master, creates the application. It runs
    /// while the state is locked, so concurrent transitions are serialized and only the first one wins.
    ///
    /// # Errors
    ///
    /// If a role was already assigned, [`RoleError::AlreadyAssigned`] is returned and nothing is initialized. If the
    /// application cannot be created, [`RoleError::InitializationFailed`] is returned and the role stays assigned
    /// without an application.
    pub fn transition(&self, role: ProcessRole, init: RoleInit<'_>) -> Result<(), RoleError> {
        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let RoleSlot::Assigned { role: current, .. } = &*slot {
            return Err(RoleError::AlreadyAssigned {
                current: *current,
                requested: role,
            });
        }

        init.namer
            .set_process_title(&role.process_title(init.service, init.host, init.port));

        if !role.hosts_application() {
            *slot = RoleSlot::Assigned { role, application: None };
            return Ok(());
        }

        let result = init.factory.create(init.config_file).context(InitializationFailed { role });
        let application = result.as_ref().ok().cloned();
        *slot = RoleSlot::Assigned { role, application };

        result.map(|_| ())
    }

    /// Returns the assigned role, if any.
    pub fn role(&self) -> Option<ProcessRole> {
        match &*self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) {
            RoleSlot::Unstarted => None,
            RoleSlot::Assigned { role, .. } => Some(*role),
        }
    }

    /// Returns the application of this process, if it was created.
    pub fn application(&self) -> Option<Arc<dyn Application>> {
        match &*self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) {
            RoleSlot::Unstarted => None,
            RoleSlot::Assigned { application, .. } => application.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use proptest::prelude::*;
    use tcpd_error::generic_error;

    use super::*;
    use crate::test_util::{RecordingApplication, RecordingNamer};

    fn ok_factory(path: &Path) -> Result<Arc<dyn Application>, GenericError> {
        assert_eq!(path, Path::new("/etc/app.yaml"));
        Ok(Arc::new(RecordingApplication::default()))
    }

    fn failing_factory(_: &Path) -> Result<Arc<dyn Application>, GenericError> {
        Err(generic_error!("missing database url"))
    }

    fn init<'a>(factory: &'a dyn ApplicationFactory, namer: &'a RecordingNamer, path: &'a Path) -> RoleInit<'a> {
        RoleInit {
            service: DEFAULT_SERVICE_NAME,
            host: "0.0.0.0",
            port: 9503,
            config_file: path,
            factory,
            namer,
        }
    }

    proptest! {
        #[test]
        fn classification_follows_worker_num(worker_num in 0usize..64, worker_id in 0usize..128) {
            let role = ProcessRole::classify(worker_id, worker_num);
            let title = role.process_title("tcpd", "0.0.0.0", 9503);

            if worker_id < worker_num {
                prop_assert_eq!(role, ProcessRole::Worker(worker_id));
                prop_assert_eq!(title, format!("tcpd: worker #{}", worker_id));
            } else {
                prop_assert_eq!(role, ProcessRole::TaskWorker(worker_id));
                prop_assert_eq!(title, format!("tcpd: task #{}", worker_id));
            }
        }
    }

    #[test]
    fn titles() {
        let cases = [
            (ProcessRole::Master, "tcpd: master 0.0.0.0:9503"),
            (ProcessRole::Manager, "tcpd: manager"),
            (ProcessRole::Worker(1), "tcpd: worker #1"),
            (ProcessRole::TaskWorker(2), "tcpd: task #2"),
        ];

        for (role, expected) in cases {
            assert_eq!(role.process_title("tcpd", "0.0.0.0", 9503), expected);
        }
    }

    #[test]
    fn worker_transition_creates_application_once() {
        let state = RoleState::new();
        let namer = RecordingNamer::default();
        let path = PathBuf::from("/etc/app.yaml");

        state
            .transition(ProcessRole::Worker(0), init(&ok_factory, &namer, &path))
            .unwrap();
        assert_eq!(state.role(), Some(ProcessRole::Worker(0)));
        assert!(state.application().is_some());
        assert_eq!(namer.titles(), vec!["tcpd: worker #0".to_string()]);

        let err = state
            .transition(ProcessRole::Manager, init(&ok_factory, &namer, &path))
            .unwrap_err();
        assert!(matches!(
            err,
            RoleError::AlreadyAssigned {
                current: ProcessRole::Worker(0),
                requested: ProcessRole::Manager
            }
        ));
        assert_eq!(state.role(), Some(ProcessRole::Worker(0)));
        assert_eq!(namer.titles().len(), 1);
    }

    #[test]
    fn master_has_no_application() {
        let state = RoleState::new();
        let namer = RecordingNamer::default();
        let path = PathBuf::from("/etc/app.yaml");

        state
            .transition(ProcessRole::Master, init(&failing_factory, &namer, &path))
            .unwrap();
        assert_eq!(state.role(), Some(ProcessRole::Master));
        assert!(state.application().is_none());
    }

    #[test]
    fn failed_initialization_keeps_role() {
        let state = RoleState::new();
        let namer = RecordingNamer::default();
        let path = PathBuf::from("/etc/app.yaml");

        let err = state
            .transition(ProcessRole::Manager, init(&failing_factory, &namer, &path))
            .unwrap_err();
        assert!(matches!(err, RoleError::InitializationFailed { role: ProcessRole::Manager, .. }));
        assert!(err.to_string().contains("missing database url"));
        assert_eq!(state.role(), Some(ProcessRole::Manager));
        assert!(state.application().is_none());
    }

    #[test]
    fn concurrent_transitions_have_one_winner() {
        let state = Arc::new(RoleState::new());
        let namer = Arc::new(RecordingNamer::default());

        let handles = (0..8)
            .map(|i| {
                let state = Arc::clone(&state);
                let namer = Arc::clone(&namer);
                std::thread::spawn(move || {
                    let path = PathBuf::from("/etc/app.yaml");
                    state
                        .transition(ProcessRole::Worker(i), init(&ok_factory, &namer, &path))
                        .is_ok()
                })
            })
            .collect::<Vec<_>>();

        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(namer.titles().len(), 1);
    }
}
