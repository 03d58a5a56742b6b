//! In-memory backend used by unit tests.

use crate::api::{ApiResult, NotesApi, ReorderRequest, SyncError};
use crate::models::{Note, NoteDraft, NotePatch, Partition};
use crate::positions::{allocate_positions, sort_notes};
use async_trait::async_trait;
use futures::channel::oneshot;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

#[derive(Default)]
pub(crate) struct FakeApi {
    /// Server-side truth.
    pub notes: RefCell<Vec<Note>>,
    /// Errors returned by the next write calls, in order.
    pub write_failures: RefCell<VecDeque<SyncError>>,
    /// Errors returned by the next read calls, in order.
    pub read_failures: RefCell<VecDeque<SyncError>>,
    /// When set, the next write call waits for the sender before answering.
    pub write_gate: RefCell<Option<oneshot::Receiver<()>>>,
    /// When set, the next read call waits for the sender before answering.
    pub read_gate: RefCell<Option<oneshot::Receiver<()>>>,
    pub calls: RefCell<Vec<String>>,
    next_id: Cell<u32>,
}

impl FakeApi {
    pub fn with_notes(notes: Vec<Note>) -> Self {
        let api = Self::default();
        *api.notes.borrow_mut() = notes;
        api
    }

    pub fn gate_writes(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.write_gate.borrow_mut() = Some(rx);
        tx
    }

    pub fn gate_reads(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.read_gate.borrow_mut() = Some(rx);
        tx
    }

    pub fn fail_writes(&self, errors: impl IntoIterator<Item = SyncError>) {
        self.write_failures.borrow_mut().extend(errors);
    }

    pub fn fail_reads(&self, errors: impl IntoIterator<Item = SyncError>) {
        self.read_failures.borrow_mut().extend(errors);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    async fn read(&self, call: String) -> ApiResult<()> {
        self.calls.borrow_mut().push(call);
        let gate = self.read_gate.borrow_mut().take();
        if let Some(rx) = gate {
            let _ = rx.await;
        }
        match self.read_failures.borrow_mut().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn write(&self, call: String) -> ApiResult<()> {
        self.calls.borrow_mut().push(call);
        let gate = self.write_gate.borrow_mut().take();
        if let Some(rx) = gate {
            let _ = rx.await;
        }
        match self.write_failures.borrow_mut().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn with_note<T>(&self, id: &str, f: impl FnOnce(&mut Note) -> T) -> ApiResult<T> {
        let mut notes = self.notes.borrow_mut();
        let note = notes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| SyncError::Api {
                status: 404,
                message: "Note not found".to_string(),
            })?;
        Ok(f(note))
    }
}

#[async_trait(?Send)]
impl NotesApi for FakeApi {
    async fn list_notes(&self, partition: Partition) -> ApiResult<Vec<Note>> {
        self.read(format!("list:{partition}")).await?;
        let mut out: Vec<Note> = self
            .notes
            .borrow()
            .iter()
            .filter(|n| n.lifecycle().partition() == partition)
            .cloned()
            .collect();
        sort_notes(out.as_mut_slice());
        Ok(out)
    }

    async fn get_note(&self, id: &str) -> ApiResult<Note> {
        self.read(format!("get:{id}")).await?;
        self.with_note(id, |n| n.clone())
    }

    async fn create_note(&self, draft: &NoteDraft) -> ApiResult<Note> {
        self.write("create".to_string()).await?;
        self.next_id.set(self.next_id.get() + 1);
        let mut note = draft.to_optimistic_note(format!("srv-{}", self.next_id.get()), 0);
        note.position = self.notes.borrow().iter().map(|n| n.position).max().unwrap_or(0) + 1;
        note.updated_at = Some("2024-01-01T00:00:00Z".to_string());
        self.notes.borrow_mut().push(note.clone());
        Ok(note)
    }

    async fn update_note(&self, note: &Note) -> ApiResult<Note> {
        self.write(format!("update:{}", note.id)).await?;
        self.with_note(&note.id, |n| {
            *n = note.clone();
            n.clone()
        })
    }

    async fn patch_note(&self, id: &str, patch: &NotePatch) -> ApiResult<Note> {
        self.write(format!("patch:{id}")).await?;
        self.with_note(id, |n| {
            patch.apply_to(n);
            n.clone()
        })
    }

    async fn delete_note(&self, id: &str) -> ApiResult<()> {
        self.write(format!("delete:{id}")).await?;
        self.with_note(id, |n| n.deleted_at = Some("2024-01-01T00:00:00Z".to_string()))
    }

    async fn restore_note(&self, id: &str) -> ApiResult<()> {
        self.write(format!("restore:{id}")).await?;
        self.with_note(id, |n| n.deleted_at = None)
    }

    async fn delete_note_permanent(&self, id: &str) -> ApiResult<()> {
        self.write(format!("purge:{id}")).await?;
        self.notes.borrow_mut().retain(|n| n.id != id);
        Ok(())
    }

    async fn empty_trash(&self) -> ApiResult<()> {
        self.write("empty_trash".to_string()).await?;
        self.notes.borrow_mut().retain(|n| n.deleted_at.is_none());
        Ok(())
    }

    async fn archive_note(&self, id: &str, archived: bool) -> ApiResult<()> {
        self.write(format!("archive:{id}:{archived}")).await?;
        self.with_note(id, |n| n.archived = archived)
    }

    async fn reorder_notes(&self, req: &ReorderRequest) -> ApiResult<()> {
        self.write("reorder".to_string()).await?;
        let mut notes = self.notes.borrow_mut();
        let active: Vec<Note> = notes
            .iter()
            .filter(|n| n.lifecycle().partition() == Partition::Active)
            .cloned()
            .collect();
        let placements = allocate_positions(10_000, &req.pinned_ids, &req.other_ids, &active);
        for n in notes.iter_mut() {
            if let Some(p) = placements.iter().find(|p| p.id == n.id) {
                n.pinned = p.pinned;
                n.position = p.position;
            }
        }
        Ok(())
    }
}
