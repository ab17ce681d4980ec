use std::time::Duration;

use campus_core::{NewNote, Note, NoteFilters, NoteUpdate};

use super::{Resource, ResourceService};

/// Shared study notes.
#[derive(Debug, Clone, Copy)]
pub struct Notes;

impl Resource for Notes {
    const NAME: &'static str = "notes";
    const PATH: &'static str = "/api/notes";
    const TTL: Duration = Duration::from_secs(5 * 60);

    type Entity = Note;
    type Filters = NoteFilters;
    type Create = NewNote;
    type Update = NoteUpdate;
}

pub type NotesService = ResourceService<Notes>;
