//! Per-note edit protection for notes other people can edit.
//!
//! The guard keeps two copies of the editable fields: `initial`, what the server last
//! agreed with, and `display`, what the user currently sees. Content (title, body) is
//! only ever sent when `display` differs from `initial`, and a remote copy only
//! replaces the displayed content while the two are still equal. Metadata (color,
//! transparency, tags, images) cannot conflict textually, so it is pushed on every
//! change and always adopted from the server.
//!
//! This is last-writer-wins per field, not a merge: two people editing the same
//! field concurrently will lose one side's change when the second one saves.

use crate::models::{Attachment, Note, NoteKind, NotePatch};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NoteFields {
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub images: Vec<Attachment>,
    pub color: String,
    pub transparency: Option<String>,
}

impl NoteFields {
    pub fn from_note(note: &Note) -> Self {
        Self {
            title: note.title.clone(),
            content: note.content.clone(),
            tags: note.tags.clone(),
            images: note.images.clone(),
            color: note.color.clone(),
            transparency: note.transparency.clone(),
        }
    }

    fn same_content(&self, other: &Self) -> bool {
        self.title == other.title && self.content == other.content
    }

    fn same_metadata(&self, other: &Self) -> bool {
        self.tags == other.tags
            && self.images == other.images
            && self.color == other.color
            && self.transparency == other.transparency
    }

    fn adopt_metadata(&mut self, from: &Self) {
        self.tags = from.tags.clone();
        self.images = from.images.clone();
        self.color = from.color.clone();
        self.transparency = from.transparency.clone();
    }

    fn adopt_content(&mut self, from: &Self) {
        self.title = from.title.clone();
        self.content = from.content.clone();
    }

    /// Patch carrying the metadata fields that differ from `base`.
    fn metadata_patch(&self, base: &Self) -> NotePatch {
        NotePatch {
            tags: (self.tags != base.tags).then(|| self.tags.clone()),
            images: (self.images != base.images).then(|| self.images.clone()),
            color: (self.color != base.color).then(|| self.color.clone()),
            transparency: (self.transparency != base.transparency)
                .then(|| self.transparency.clone()),
            ..Default::default()
        }
    }

    /// Patch carrying the content fields that differ from `base`.
    fn content_patch(&self, base: &Self) -> NotePatch {
        NotePatch {
            title: (self.title != base.title).then(|| self.title.clone()),
            content: (self.content != base.content).then(|| self.content.clone()),
            ..Default::default()
        }
    }
}

/// What happened to an incoming server copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Server content replaced the display.
    Adopted,
    /// The user has unsaved edits; server content was not shown.
    Ignored,
    /// Server content matched what is already displayed.
    Unchanged,
}

#[derive(Clone, Debug)]
pub struct ConflictGuard {
    note_id: String,
    guarded: bool,
    editing: bool,
    initial: NoteFields,
    display: NoteFields,
}

impl ConflictGuard {
    /// Capture the initial snapshot. Guarding applies to collaborative plain-text notes.
    pub fn open(note: &Note, current_user_id: Option<&str>) -> Self {
        let fields = NoteFields::from_note(note);
        Self {
            note_id: note.id.clone(),
            guarded: note.kind == NoteKind::Text && note.is_collaborative(current_user_id),
            editing: false,
            initial: fields.clone(),
            display: fields,
        }
    }

    pub fn note_id(&self) -> &str {
        &self.note_id
    }

    pub fn is_guarded(&self) -> bool {
        self.guarded
    }

    pub fn is_editing(&self) -> bool {
        self.editing
    }

    pub fn set_editing(&mut self, editing: bool) {
        self.editing = editing;
    }

    pub fn display(&self) -> &NoteFields {
        &self.display
    }

    pub fn initial(&self) -> &NoteFields {
        &self.initial
    }

    /// The user changed title or body since the last agreed copy.
    pub fn is_dirty(&self) -> bool {
        !self.display.same_content(&self.initial)
    }

    pub fn edit_title(&mut self, title: impl Into<String>) {
        self.display.title = title.into();
    }

    pub fn edit_content(&mut self, content: impl Into<String>) {
        self.display.content = content.into();
    }

    /// Change metadata locally and return the patch to push right away, if anything
    /// actually changed. The snapshot follows, since the push is immediate.
    pub fn set_metadata(&mut self, f: impl FnOnce(&mut NoteFields)) -> Option<NotePatch> {
        let before = self.display.clone();
        f(&mut self.display);
        // Content edits go through edit_title / edit_content.
        self.display.adopt_content(&before);
        let patch = self.display.metadata_patch(&before);
        let display = self.display.clone();
        self.initial.adopt_metadata(&display);
        (!patch.is_empty()).then_some(patch)
    }

    /// Content to autosave: only in edit mode, and only what the user changed.
    pub fn content_patch(&self) -> Option<NotePatch> {
        if !self.editing {
            return None;
        }
        self.pending_content()
    }

    fn pending_content(&self) -> Option<NotePatch> {
        let patch = self.display.content_patch(&self.initial);
        (!patch.is_empty()).then_some(patch)
    }

    /// Record that `saved` reached the server; it becomes the agreed copy.
    pub fn mark_saved(&mut self, saved: &NotePatch) {
        if let Some(t) = &saved.title {
            self.initial.title = t.clone();
        }
        if let Some(c) = &saved.content {
            self.initial.content = c.clone();
        }
    }

    pub fn on_remote_update(&mut self, remote: &Note) -> RemoteOutcome {
        if remote.id != self.note_id {
            return RemoteOutcome::Unchanged;
        }
        let incoming = NoteFields::from_note(remote);

        let metadata_changed = !self.display.same_metadata(&incoming);
        self.initial.adopt_metadata(&incoming);
        self.display.adopt_metadata(&incoming);

        if self.display.same_content(&incoming) {
            // `initial` advances only through mark_saved.
            return if metadata_changed {
                RemoteOutcome::Adopted
            } else {
                RemoteOutcome::Unchanged
            };
        }
        if self.is_dirty() {
            tracing::debug!(id = %self.note_id, "keeping local edit over remote content");
            return RemoteOutcome::Ignored;
        }
        self.initial.adopt_content(&incoming);
        self.display.adopt_content(&incoming);
        RemoteOutcome::Adopted
    }

    /// Final flush on close: whatever the user changed, edit mode or not.
    pub fn close(&mut self) -> Option<NotePatch> {
        self.editing = false;
        self.pending_content()
    }
}
