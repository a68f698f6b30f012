use crate::note::Note;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Info {
    pub id: &'static str,
    pub version: &'static str,
}

/// A check that inspects cluster state and reports its findings as notes.
pub trait Vetter {
    fn info(&self) -> Info;

    /// Runs one pass. An error and a list of notes are never returned together.
    fn vet(&self) -> anyhow::Result<Vec<Note>>;
}
