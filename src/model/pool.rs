use crate::imap::CommandHandle;
use crate::model::ConnectionId;
use crate::tasks::{ImapTask, TaskId, TaskKind, TaskOutcome, TaskState};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::oneshot;

/// A task together with the bookkeeping the model keeps about it
#[derive(Debug)]
pub struct TaskEntry {
    pub id: TaskId,
    pub task: TaskKind,
    pub state: TaskState,
    pub connection: ConnectionId,
    pub prerequisite: Option<TaskId>,
    pub dependents: Vec<TaskId>,
    /// Handles issued and not yet answered
    pub handles: Vec<CommandHandle>,
    pub description: String,
    pub(crate) waiters: Vec<oneshot::Sender<TaskOutcome>>,
}

impl TaskEntry {
    pub fn new(
        id: TaskId,
        task: TaskKind,
        connection: ConnectionId,
        prerequisite: Option<TaskId>,
    ) -> Self {
        let description = task.describe();
        Self {
            id,
            task,
            state: TaskState::Unstarted,
            connection,
            prerequisite,
            dependents: Vec::new(),
            handles: Vec::new(),
            description,
            waiters: Vec::new(),
        }
    }
}

/// Owner of every task, of the handle-to-task map and of the ready queue
#[derive(Debug, Default)]
pub struct TaskPool {
    tasks: BTreeMap<TaskId, TaskEntry>,
    handles: HashMap<(ConnectionId, CommandHandle), TaskId>,
    ready: VecDeque<TaskId>,
    next_id: u64,
}

impl TaskPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_id(&mut self) -> TaskId {
        self.next_id += 1;
        TaskId(self.next_id)
    }

    pub fn insert(&mut self, entry: TaskEntry) {
        self.tasks.insert(entry.id, entry);
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskEntry> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut TaskEntry> {
        self.tasks.get_mut(&id)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn remove(&mut self, id: TaskId) -> Option<TaskEntry> {
        self.tasks.remove(&id)
    }

    /// Tasks in creation order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &TaskEntry> {
        self.tasks.values()
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.tasks.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn state(&self, id: TaskId) -> Option<&TaskState> {
        self.tasks.get(&id).map(|entry| &entry.state)
    }

    /// Non-terminal tasks on a connection, in creation order
    pub fn live_on(&self, connection: ConnectionId) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|entry| entry.connection == connection && !entry.state.is_terminal())
            .map(|entry| entry.id)
            .collect()
    }

    /// Length of the prerequisite chain above a task
    pub fn depth(&self, id: TaskId) -> usize {
        let mut depth = 0;
        let mut cursor = self.get(id).and_then(|entry| entry.prerequisite);
        while let Some(current) = cursor {
            depth += 1;
            cursor = self.get(current).and_then(|entry| entry.prerequisite);
        }
        depth
    }

    pub fn enqueue(&mut self, id: TaskId) {
        self.ready.push_back(id);
    }

    pub fn pop_ready(&mut self) -> Option<TaskId> {
        self.ready.pop_front()
    }

    pub fn register_handle(&mut self, connection: ConnectionId, handle: CommandHandle, owner: TaskId) {
        if let Some(entry) = self.tasks.get_mut(&owner) {
            entry.handles.push(handle.clone());
        }
        self.handles.insert((connection, handle), owner);
    }

    /// Remove the handle from the map and from its owner, returning the owner
    pub fn reclaim(&mut self, connection: ConnectionId, handle: &CommandHandle) -> Option<TaskId> {
        let owner = self.handles.remove(&(connection, handle.clone()))?;
        if let Some(entry) = self.tasks.get_mut(&owner) {
            entry.handles.retain(|h| h != handle);
        }
        Some(owner)
    }

    /// Drop every handle issued on a connection
    pub fn reclaim_connection(&mut self, connection: ConnectionId) -> usize {
        let before = self.handles.len();
        self.handles.retain(|(conn, _), _| *conn != connection);
        for entry in self.tasks.values_mut() {
            if entry.connection == connection {
                entry.handles.clear();
            }
        }
        before - self.handles.len()
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub fn owner_of(&self, connection: ConnectionId, handle: &CommandHandle) -> Option<TaskId> {
        self.handles.get(&(connection, handle.clone())).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::NoopTask;

    fn noop_entry(pool: &mut TaskPool, prerequisite: Option<TaskId>) -> TaskId {
        let id = pool.allocate_id();
        pool.insert(TaskEntry::new(
            id,
            TaskKind::Noop(NoopTask::new()),
            ConnectionId(1),
            prerequisite,
        ));
        id
    }

    #[test]
    fn test_handles_are_one_to_one() {
        let mut pool = TaskPool::new();
        let a = noop_entry(&mut pool, None);
        let b = noop_entry(&mut pool, None);
        let tag = CommandHandle::from_wire("A1");

        pool.register_handle(ConnectionId(1), tag.clone(), a);
        pool.register_handle(ConnectionId(2), tag.clone(), b);
        assert_eq!(pool.owner_of(ConnectionId(1), &tag), Some(a));
        assert_eq!(pool.owner_of(ConnectionId(2), &tag), Some(b));

        assert_eq!(pool.reclaim(ConnectionId(1), &tag), Some(a));
        assert_eq!(pool.reclaim(ConnectionId(1), &tag), None);
        assert!(pool.get(a).unwrap().handles.is_empty());
        assert_eq!(pool.handle_count(), 1);
    }

    #[test]
    fn test_depth_follows_prerequisites() {
        let mut pool = TaskPool::new();
        let a = noop_entry(&mut pool, None);
        let b = noop_entry(&mut pool, Some(a));
        let c = noop_entry(&mut pool, Some(b));
        assert_eq!(pool.depth(a), 0);
        assert_eq!(pool.depth(c), 2);
        assert_eq!(pool.ids(), vec![a, b, c]);
    }

    #[test]
    fn test_ready_queue_is_fifo() {
        let mut pool = TaskPool::new();
        let a = noop_entry(&mut pool, None);
        let b = noop_entry(&mut pool, None);
        pool.enqueue(b);
        pool.enqueue(a);
        assert_eq!(pool.pop_ready(), Some(b));
        assert_eq!(pool.pop_ready(), Some(a));
        assert_eq!(pool.pop_ready(), None);
    }
}
