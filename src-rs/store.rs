use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::gateway::CodeGenGateway;
use crate::orchestrator::Orchestrator;
use crate::persist::ArtifactWriter;
use crate::render::Renderer;
use crate::scorer::{Evaluator, JudgeService};
use crate::session::{
    new_session_id, CancelFlag, Progress, ProgressObserver, Session, SessionEvent, SessionId,
    SessionStatus, Summary,
};
use crate::target::TargetImage;
use log::info;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

struct Entry {
    snapshot: Mutex<Session>,
    /// Present until `start` hands the session to its task.
    pending: Mutex<Option<Session>>,
    progress: watch::Sender<Progress>,
    cancel: CancelFlag,
}

impl Entry {
    fn publish(&self, session: &Session) {
        *self.snapshot.lock() = session.clone();
        self.progress.send_replace(session.progress());
    }
}

struct Publisher {
    entry: Arc<Entry>,
}

impl ProgressObserver for Publisher {
    fn on_event(&self, event: &SessionEvent<'_>) {
        self.entry.publish(event.session());
    }
}

/// Owns every session's lifecycle; each started session runs on its own task.
pub struct SessionStore<G, R, J> {
    gateway: Arc<G>,
    renderer: Arc<R>,
    judge: Arc<J>,
    artifacts: Option<ArtifactWriter>,
    sessions: Mutex<HashMap<SessionId, Arc<Entry>>>,
}

impl<G, R, J> SessionStore<G, R, J>
where
    G: CodeGenGateway + 'static,
    R: Renderer + 'static,
    J: JudgeService + 'static,
{
    pub fn new(gateway: Arc<G>, renderer: Arc<R>, judge: Arc<J>) -> Self {
        Self {
            gateway,
            renderer,
            judge,
            artifacts: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_artifacts(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifacts = Some(ArtifactWriter::new(root));
        self
    }

    /// Validates and registers a session; no round runs until `start`.
    pub fn create_session(
        &self,
        config: SessionConfig,
        target: TargetImage,
    ) -> Result<SessionId, SessionError> {
        config.validate()?;
        let id = new_session_id();
        let session = Session::new(id.clone(), config, Arc::new(target));
        let (progress, _) = watch::channel(session.progress());
        let entry = Arc::new(Entry {
            snapshot: Mutex::new(session.clone()),
            pending: Mutex::new(Some(session)),
            progress,
            cancel: CancelFlag::default(),
        });
        self.sessions.lock().insert(id.clone(), entry);
        info!("created {id}");
        Ok(id)
    }

    pub fn start(&self, id: &str) -> Result<(), SessionError> {
        let entry = self.entry(id)?;
        let session = entry
            .pending
            .lock()
            .take()
            .ok_or_else(|| SessionError::AlreadyStarted(id.to_string()))?;

        let scorer = Evaluator::from_config(&session.config, Arc::clone(&self.judge));
        let orchestrator =
            Orchestrator::new(Arc::clone(&self.gateway), Arc::clone(&self.renderer), scorer);
        let observer = (
            Publisher {
                entry: Arc::clone(&entry),
            },
            self.artifacts.clone(),
        );
        let cancel = entry.cancel.clone();
        tokio::spawn(async move {
            let finished = orchestrator.run(session, &observer, &cancel).await;
            observer.0.entry.publish(&finished);
        });
        Ok(())
    }

    pub fn progress(&self, id: &str) -> Result<Progress, SessionError> {
        Ok(self.entry(id)?.progress.borrow().clone())
    }

    /// Receiver that wakes on every status change or completed round.
    pub fn subscribe(&self, id: &str) -> Result<watch::Receiver<Progress>, SessionError> {
        Ok(self.entry(id)?.progress.subscribe())
    }

    pub fn result(&self, id: &str) -> Result<Summary, SessionError> {
        let entry = self.entry(id)?;
        let snapshot = entry.snapshot.lock();
        if !snapshot.status.is_terminal() {
            return Err(SessionError::NotFinished(id.to_string()));
        }
        Ok(snapshot.summary())
    }

    /// Stops the session before its next round. A session that never started ends immediately.
    pub fn cancel(&self, id: &str) -> Result<(), SessionError> {
        let entry = self.entry(id)?;
        entry.cancel.cancel();
        let never_started = entry.pending.lock().take();
        if let Some(mut session) = never_started {
            session.finish(SessionStatus::Cancelled);
            entry.publish(&session);
        }
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<(), SessionError> {
        let entry = self
            .sessions
            .lock()
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        entry.cancel.cancel();
        Ok(())
    }

    /// Waits for a terminal status and returns the summary.
    pub async fn wait(&self, id: &str) -> Result<Summary, SessionError> {
        let mut rx = self.subscribe(id)?;
        // Err only if the sender is gone, i.e. the session was deleted.
        rx.wait_for(|progress| progress.status.is_terminal())
            .await
            .map_err(|_| SessionError::NotFound(id.to_string()))?;
        self.result(id)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn entry(&self, id: &str) -> Result<Arc<Entry>, SessionError> {
        self.sessions
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }
}
