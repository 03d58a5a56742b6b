use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Prefix for client-generated ids that have not been confirmed by the backend yet.
pub const TMP_ID_PREFIX: &str = "tmp-";

/// Closed set of note payload types.
///
/// `content` is interpreted per kind: markdown for `Text`, JSON-encoded items for
/// `Checklist`, JSON-encoded strokes for `Drawing`, a URL for the embeds.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, AsRefStr, Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NoteKind {
    #[default]
    Text,
    Checklist,
    Drawing,
    Youtube,
    Music,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub id: String,
    /// Inline-encoded bytes (data URL).
    pub src: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Collaborator {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

/// Exactly one lifecycle state holds for a note at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, AsRefStr, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Lifecycle {
    Active,
    Archived,
    Trashed,
}

impl Lifecycle {
    /// List partition a note in this state is listed under.
    pub fn partition(self) -> Partition {
        match self {
            Lifecycle::Active => Partition::Active,
            Lifecycle::Archived => Partition::Archived,
            Lifecycle::Trashed => Partition::Trash,
        }
    }
}

/// Named note lists served by the backend.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, AsRefStr, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Partition {
    Active,
    Archived,
    Trash,
}

impl Partition {
    pub const ALL: [Partition; 3] = [Partition::Active, Partition::Archived, Partition::Trash];

    pub fn path(self) -> &'static str {
        match self {
            Partition::Active => "/notes",
            Partition::Archived => "/notes/archived",
            Partition::Trash => "/notes/trash",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,

    #[serde(rename = "type", default)]
    pub kind: NoteKind,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub content: String,

    /// Display order is preserved; matching ignores order.
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub images: Vec<Attachment>,

    #[serde(default)]
    pub color: String,

    #[serde(default)]
    pub transparency: Option<String>,

    #[serde(default)]
    pub pinned: bool,

    #[serde(default)]
    pub archived: bool,

    #[serde(default)]
    pub deleted_at: Option<String>,

    /// Manual sort key; larger sorts first within a partition.
    #[serde(default)]
    pub position: i64,

    #[serde(default)]
    pub updated_at: Option<String>,

    #[serde(default)]
    pub last_edited_by: Option<String>,

    #[serde(default)]
    pub last_edited_at: Option<String>,

    #[serde(default)]
    pub owner_id: Option<String>,

    #[serde(default)]
    pub collaborators: Option<Vec<Collaborator>>,
}

impl Note {
    pub fn lifecycle(&self) -> Lifecycle {
        if self.deleted_at.is_some() {
            Lifecycle::Trashed
        } else if self.archived {
            Lifecycle::Archived
        } else {
            Lifecycle::Active
        }
    }

    pub fn is_tmp(&self) -> bool {
        is_tmp_id(&self.id)
    }

    /// A note is collaborative when it lists other users or belongs to someone else.
    pub fn is_collaborative(&self, current_user_id: Option<&str>) -> bool {
        if self.collaborators.as_ref().is_some_and(|c| !c.is_empty()) {
            return true;
        }
        match (self.owner_id.as_deref(), current_user_id) {
            (Some(owner), Some(me)) => owner != me,
            _ => false,
        }
    }

    /// Tag equality ignoring order and duplicates.
    pub fn same_tags(&self, other: &[String]) -> bool {
        let mut a: Vec<&str> = self.tags.iter().map(String::as_str).collect();
        let mut b: Vec<&str> = other.iter().map(String::as_str).collect();
        a.sort_unstable();
        a.dedup();
        b.sort_unstable();
        b.dedup();
        a == b
    }
}

/// Payload for creating a note. The client assigns a tmp id for the optimistic copy.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NoteDraft {
    #[serde(rename = "type")]
    pub kind: NoteKind,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub images: Vec<Attachment>,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub transparency: Option<String>,
    #[serde(default)]
    pub pinned: bool,
}

impl NoteDraft {
    /// Optimistic note shown until the backend returns the canonical one.
    pub fn to_optimistic_note(&self, tmp_id: String, position: i64) -> Note {
        Note {
            id: tmp_id,
            kind: self.kind,
            title: self.title.clone(),
            content: self.content.clone(),
            tags: self.tags.clone(),
            images: self.images.clone(),
            color: self.color.clone(),
            transparency: self.transparency.clone(),
            pinned: self.pinned,
            archived: false,
            deleted_at: None,
            position,
            updated_at: None,
            last_edited_by: None,
            last_edited_at: None,
            owner_id: None,
            collaborators: None,
        }
    }
}

/// Partial update. `None` leaves the field untouched.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<Attachment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transparency: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
}

impl NotePatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, note: &mut Note) {
        if let Some(v) = &self.title {
            note.title = v.clone();
        }
        if let Some(v) = &self.content {
            note.content = v.clone();
        }
        if let Some(v) = &self.tags {
            note.tags = v.clone();
        }
        if let Some(v) = &self.images {
            note.images = v.clone();
        }
        if let Some(v) = &self.color {
            note.color = v.clone();
        }
        if let Some(v) = &self.transparency {
            note.transparency = v.clone();
        }
        if let Some(v) = self.pinned {
            note.pinned = v;
        }
        if let Some(v) = self.position {
            note.position = v;
        }
    }
}

pub fn is_tmp_id(id: &str) -> bool {
    id.starts_with(TMP_ID_PREFIX)
}

pub fn make_tmp_id(now_ms: i64, rand: u64) -> String {
    format!("{TMP_ID_PREFIX}{now_ms}-{rand:x}")
}

#[cfg(test)]
pub(crate) fn test_note(id: &str, position: i64) -> Note {
    NoteDraft {
        title: id.to_string(),
        ..Default::default()
    }
    .to_optimistic_note(id.to_string(), position)
}
