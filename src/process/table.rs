use std::collections::BTreeMap;
use std::os::unix::io::RawFd;

use super::group::ProcessGroup;
use super::{ManagedProcess, PipeKind};

/// Every live program group, keyed by name. The table itself is plain
/// data; the single mutex guarding it lives with the owner as
/// `Arc<Mutex<ProcessTable>>` and is taken by both the reactor and the
/// supervisor for every access.
#[derive(Default)]
pub struct ProcessTable {
    groups: BTreeMap<String, ProcessGroup>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, group: ProcessGroup) {
        self.groups.insert(group.config().name.to_string(), group);
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ProcessGroup> {
        self.groups.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    /// Moves a group out of the table, preserving its replicas and their
    /// pids. Used by the reconfigurer to carry unchanged programs over.
    pub fn take(&mut self, name: &str) -> Option<ProcessGroup> {
        self.groups.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ProcessGroup)> {
        self.groups.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut ProcessGroup)> {
        self.groups.iter_mut()
    }

    pub fn replicas_mut(&mut self) -> impl Iterator<Item = &mut ManagedProcess> {
        self.groups
            .values_mut()
            .flat_map(|group| group.replicas_mut().iter_mut())
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.groups.keys()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn find_by_fd(&mut self, fd: RawFd) -> Option<(&mut ManagedProcess, PipeKind)> {
        self.groups
            .values_mut()
            .find_map(|group| group.find_by_fd(fd))
    }

    /// Removes a session handle from every replica it was attached to.
    pub fn detach_session(&mut self, session_id: RawFd) {
        for replica in self.replicas_mut() {
            replica.detach(session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::{AutoRestart, ProgramConfig, ProgramName, StopSignal};

    fn group(name: &str) -> ProcessGroup {
        ProcessGroup::new(ProgramConfig {
            name: ProgramName::try_from(name.to_string()).unwrap(),
            argv: vec!["/bin/true".to_string()],
            exec_path: PathBuf::from("/bin/true"),
            workingdir: None,
            stdout_path: None,
            stderr_path: None,
            stopsignal: StopSignal::default(),
            numprocs: 1,
            starttime: 0,
            startretries: 0,
            stoptime: 1,
            umask: 0o022,
            autostart: true,
            autorestart: AutoRestart::False,
            env: Vec::new(),
            exitcodes: vec![0],
        })
        .unwrap()
    }

    #[test]
    fn insert_lookup_take() {
        let mut table = ProcessTable::new();
        table.insert(group("alpha"));
        table.insert(group("beta"));

        assert_eq!(table.len(), 2);
        assert!(table.contains("alpha"));
        assert!(table.get_mut("beta").is_some());
        assert!(table.get_mut("gamma").is_none());

        let moved = table.take("alpha").unwrap();
        assert_eq!(&*moved.config().name, "alpha");
        assert_eq!(table.len(), 1);
        assert!(!table.contains("alpha"));
    }

    #[test]
    fn names_are_ordered() {
        let mut table = ProcessTable::new();
        table.insert(group("zeta"));
        table.insert(group("alpha"));
        let names: Vec<_> = table.names().cloned().collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn find_by_fd_misses_unspawned_replicas() {
        let mut table = ProcessTable::new();
        table.insert(group("alpha"));
        assert!(table.find_by_fd(42).is_none());
    }
}
