use crate::api::{ReorderRequest, SyncError};
use crate::cache::{CacheKey, CacheStore, CacheValue};
use crate::models::{is_tmp_id, Note, NoteDraft, NoteKind, NotePatch, Partition};
use crate::positions::{allocate_positions, apply_placements, position_for_new_note, sort_notes};

/// One user-level write, with its typed payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Create { draft: NoteDraft },
    Update { note: Note },
    Patch { id: String, patch: NotePatch },
    /// Soft delete into the trash.
    Delete { id: String },
    Restore { id: String },
    DeletePermanent { id: String },
    EmptyTrash,
    Archive { id: String, archived: bool },
    Reorder {
        pinned_ids: Vec<String>,
        other_ids: Vec<String>,
    },
}

/// Cache writes that make a mutation visible before the backend confirms it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OptimisticPlan {
    pub writes: Vec<(CacheKey, Option<CacheValue>)>,
    /// Id given to a created note until the backend assigns one.
    pub tmp_id: Option<String>,
}

impl OptimisticPlan {
    pub fn keys(&self) -> Vec<CacheKey> {
        self.writes.iter().map(|(k, _)| k.clone()).collect()
    }
}

impl Mutation {
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::Create { .. } => "create",
            Mutation::Update { .. } => "update",
            Mutation::Patch { .. } => "patch",
            Mutation::Delete { .. } => "delete",
            Mutation::Restore { .. } => "restore",
            Mutation::DeletePermanent { .. } => "delete_permanent",
            Mutation::EmptyTrash => "empty_trash",
            Mutation::Archive { .. } => "archive",
            Mutation::Reorder { .. } => "reorder",
        }
    }

    pub fn target_id(&self) -> Option<&str> {
        match self {
            Mutation::Update { note } => Some(&note.id),
            Mutation::Patch { id, .. }
            | Mutation::Delete { id }
            | Mutation::Restore { id }
            | Mutation::DeletePermanent { id }
            | Mutation::Archive { id, .. } => Some(id),
            Mutation::Create { .. } | Mutation::EmptyTrash | Mutation::Reorder { .. } => None,
        }
    }

    pub fn reorder_request(&self) -> Option<ReorderRequest> {
        match self {
            Mutation::Reorder {
                pinned_ids,
                other_ids,
            } => Some(ReorderRequest {
                pinned_ids: pinned_ids.clone(),
                other_ids: other_ids.clone(),
            }),
            _ => None,
        }
    }

    /// A pin toggle without an explicit position moves the note to the top of the
    /// group it joins. Called once before planning so the optimistic copy and the
    /// request carry the same position.
    pub fn with_pin_position(self, store: &CacheStore, now_ms: i64) -> Self {
        let (id, mut patch) = match self {
            Mutation::Patch { id, patch } => (id, patch),
            other => return other,
        };
        if let (Some(pinned), None) = (patch.pinned, patch.position) {
            let changes = store.find_note(&id).is_some_and(|n| n.pinned != pinned);
            if changes {
                let group: Vec<Note> = store
                    .read_list(Partition::Active)
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|n| n.pinned == pinned && n.id != id)
                    .collect();
                patch.position = Some(position_for_new_note(now_ms, &group));
            }
        }
        Mutation::Patch { id, patch }
    }

    /// Client-side shape checks. Failures are terminal; nothing is applied or sent.
    pub fn validate(&self) -> Result<(), SyncError> {
        if let Some(id) = self.target_id() {
            if id.trim().is_empty() {
                return Err(SyncError::Validation("note id is empty".into()));
            }
            if is_tmp_id(id) {
                return Err(SyncError::Validation(format!(
                    "note {id} is still being created"
                )));
            }
        }

        match self {
            Mutation::Create { draft } => validate_content(draft.kind, &draft.content),
            Mutation::Update { note } => validate_content(note.kind, &note.content),
            Mutation::Patch { patch, .. } => {
                if patch.is_empty() {
                    Err(SyncError::Validation("patch has no fields".into()))
                } else {
                    Ok(())
                }
            }
            Mutation::Reorder {
                pinned_ids,
                other_ids,
            } => {
                if let Some(dup) = pinned_ids.iter().find(|id| other_ids.contains(id)) {
                    return Err(SyncError::Validation(format!(
                        "note {dup} is both pinned and unpinned"
                    )));
                }
                if pinned_ids.iter().chain(other_ids).any(|id| is_tmp_id(id)) {
                    return Err(SyncError::Validation(
                        "cannot reorder notes that are still being created".into(),
                    ));
                }
                Ok(())
            }
            Mutation::Delete { .. }
            | Mutation::Restore { .. }
            | Mutation::DeletePermanent { .. }
            | Mutation::EmptyTrash
            | Mutation::Archive { .. } => Ok(()),
        }
    }

    /// Compute the post-mutation value of every cache entry this mutation touches.
    ///
    /// Only lists that are already loaded are rewritten; a list that was never
    /// fetched stays absent rather than becoming a partial list.
    pub fn plan(&self, store: &CacheStore, now_ms: i64, tmp_id: &str) -> OptimisticPlan {
        let mut plan = ListEdits::load(store);

        match self {
            Mutation::Create { draft } => {
                let active = plan.list(Partition::Active).cloned().unwrap_or_default();
                let note = draft
                    .to_optimistic_note(tmp_id.to_string(), position_for_new_note(now_ms, &active));
                // A create must be visible even before the active list was ever loaded.
                plan.ensure_list(Partition::Active);
                plan.insert(Partition::Active, note);
                return plan.finish(Some(tmp_id.to_string()));
            }
            Mutation::Update { note } => {
                plan.map_note(&note.id, |n| *n = note.clone());
                plan.detail(store, &note.id, |n| *n = note.clone());
            }
            Mutation::Patch { id, patch } => {
                plan.map_note(id, |n| patch.apply_to(n));
                plan.detail(store, id, |n| patch.apply_to(n));
            }
            Mutation::Delete { id } => {
                let deleted_at = iso_timestamp(now_ms);
                if let Some(mut note) = plan.take(id, &[Partition::Active, Partition::Archived]) {
                    note.deleted_at = Some(deleted_at.clone());
                    plan.insert(Partition::Trash, note);
                }
                plan.detail(store, id, |n| n.deleted_at = Some(deleted_at.clone()));
            }
            Mutation::Restore { id } => {
                if let Some(mut note) = plan.take(id, &[Partition::Trash]) {
                    note.deleted_at = None;
                    let target = if note.archived {
                        Partition::Archived
                    } else {
                        Partition::Active
                    };
                    plan.insert(target, note);
                }
                plan.detail(store, id, |n| n.deleted_at = None);
            }
            Mutation::DeletePermanent { id } => {
                plan.take(id, &Partition::ALL);
                plan.remove_detail(store, id);
            }
            Mutation::EmptyTrash => {
                let trashed: Vec<String> = plan
                    .list(Partition::Trash)
                    .map(|l| l.iter().map(|n| n.id.clone()).collect())
                    .unwrap_or_default();
                if let Some(trash) = plan.list_mut(Partition::Trash) {
                    trash.clear();
                }
                for id in trashed.iter() {
                    plan.remove_detail(store, id);
                }
            }
            Mutation::Archive { id, archived } => {
                let (from, to) = if *archived {
                    (Partition::Active, Partition::Archived)
                } else {
                    (Partition::Archived, Partition::Active)
                };
                if let Some(mut note) = plan.take(id, &[from]) {
                    note.archived = *archived;
                    plan.insert(to, note);
                }
                plan.detail(store, id, |n| n.archived = *archived);
            }
            Mutation::Reorder {
                pinned_ids,
                other_ids,
            } => {
                if let Some(active) = plan.list_mut(Partition::Active) {
                    let placements = allocate_positions(now_ms, pinned_ids, other_ids, active);
                    apply_placements(active, &placements);
                }
                plan.touch(Partition::Active);
            }
        }

        plan.finish(None)
    }
}

fn validate_content(kind: NoteKind, content: &str) -> Result<(), SyncError> {
    let expect_json = matches!(kind, NoteKind::Checklist | NoteKind::Drawing);
    if !expect_json || content.trim().is_empty() {
        return Ok(());
    }
    match serde_json::from_str::<serde_json::Value>(content) {
        Ok(v) if kind == NoteKind::Checklist && !v.is_array() => Err(SyncError::Validation(
            "checklist content must be a JSON array".into(),
        )),
        Ok(_) => Ok(()),
        Err(e) => Err(SyncError::Validation(format!(
            "{kind} content is not valid JSON: {e}"
        ))),
    }
}

fn iso_timestamp(ms: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms)
        .map(|d| d.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_default()
}

/// Working copy of the loaded lists plus any per-note entry writes.
struct ListEdits {
    lists: Vec<(Partition, Vec<Note>, bool)>,
    details: Vec<(CacheKey, Option<CacheValue>)>,
}

impl ListEdits {
    fn load(store: &CacheStore) -> Self {
        let lists = Partition::ALL
            .iter()
            .filter_map(|p| store.read_list(*p).map(|notes| (*p, notes, false)))
            .collect();
        Self {
            lists,
            details: Vec::new(),
        }
    }

    fn list(&self, p: Partition) -> Option<&Vec<Note>> {
        self.lists.iter().find(|(q, _, _)| *q == p).map(|(_, l, _)| l)
    }

    fn list_mut(&mut self, p: Partition) -> Option<&mut Vec<Note>> {
        self.lists.iter_mut().find(|(q, _, _)| *q == p).map(|(_, l, changed)| {
            *changed = true;
            l
        })
    }

    fn ensure_list(&mut self, p: Partition) {
        if self.list(p).is_none() {
            self.lists.push((p, Vec::new(), true));
        }
    }

    fn touch(&mut self, p: Partition) {
        let _ = self.list_mut(p);
    }

    fn map_note(&mut self, id: &str, mut f: impl FnMut(&mut Note)) {
        for (_, list, changed) in self.lists.iter_mut() {
            if let Some(n) = list.iter_mut().find(|n| n.id == id) {
                f(n);
                *changed = true;
                sort_notes(list.as_mut_slice());
            }
        }
    }

    /// Remove the note from the first of `from` that holds it.
    fn take(&mut self, id: &str, from: &[Partition]) -> Option<Note> {
        let mut taken = None;
        for (p, list, changed) in self.lists.iter_mut() {
            if !from.contains(p) {
                continue;
            }
            if let Some(idx) = list.iter().position(|n| n.id == id) {
                let note = list.remove(idx);
                *changed = true;
                taken.get_or_insert(note);
            }
        }
        taken
    }

    fn insert(&mut self, p: Partition, note: Note) {
        if let Some(list) = self.list_mut(p) {
            list.retain(|n| n.id != note.id);
            list.insert(0, note);
            sort_notes(list.as_mut_slice());
        }
    }

    fn detail(&mut self, store: &CacheStore, id: &str, f: impl FnOnce(&mut Note)) {
        if let Some(mut note) = store.read_note(id) {
            f(&mut note);
            self.details
                .push((CacheKey::note(id), Some(CacheValue::Note(note))));
        }
    }

    fn remove_detail(&mut self, store: &CacheStore, id: &str) {
        if store.read(&CacheKey::note(id)).is_some() {
            self.details.push((CacheKey::note(id), None));
        }
    }

    fn finish(self, tmp_id: Option<String>) -> OptimisticPlan {
        let mut writes: Vec<(CacheKey, Option<CacheValue>)> = self
            .lists
            .into_iter()
            .filter(|(_, _, changed)| *changed)
            .map(|(p, notes, _)| (CacheKey::List(p), Some(CacheValue::Notes(notes))))
            .collect();
        writes.extend(self.details);
        OptimisticPlan { writes, tmp_id }
    }
}
