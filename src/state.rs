use crate::note::Note;
use crate::vetter::{Info, Vetter};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// The outcome of one successful vet pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub generated_at: DateTime<Utc>,
    pub info: Info,
    pub notes: Vec<Note>,
}

impl Report {
    pub fn collect<V: Vetter + ?Sized>(vetter: &V) -> anyhow::Result<Self> {
        let notes = vetter.vet()?;
        Ok(Report {
            generated_at: Utc::now(),
            info: vetter.info(),
            notes,
        })
    }
}

#[derive(Clone, Default)]
pub struct AppState {
    ready: Arc<AtomicBool>,
    latest: Arc<RwLock<Option<Report>>>,
}

impl AppState {
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub async fn publish(&self, report: Report) {
        *self.latest.write().await = Some(report);
    }

    pub async fn latest(&self) -> Option<Report> {
        self.latest.read().await.clone()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{StubVetter, one_note};
    use super::*;

    #[test]
    fn test_report_collect() {
        let report = Report::collect(&StubVetter(Ok(one_note()))).expect("report");
        assert_eq!(report.info.id, "Stub");
        assert_eq!(report.notes, one_note());
    }

    #[test]
    fn test_report_collect_propagates_error() {
        assert!(Report::collect(&StubVetter(Err("boom".into()))).is_err());
    }

    #[tokio::test]
    async fn test_app_state_publish() {
        let state = AppState::default();
        assert!(!state.is_ready());
        assert!(state.latest().await.is_none());

        state.mark_ready();
        state
            .publish(Report::collect(&StubVetter(Ok(one_note()))).expect("report"))
            .await;
        assert!(state.is_ready());
        assert_eq!(state.latest().await.map(|r| r.notes.len()), Some(1));
    }
}
