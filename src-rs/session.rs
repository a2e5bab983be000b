use crate::config::SessionConfig;
use crate::render::RenderIssue;
use crate::scorer::{Evaluation, ScoreScale};
use crate::target::TargetImage;
use chrono::{DateTime, Utc};
use image::RgbaImage;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub type SessionId = String;

pub fn new_session_id() -> SessionId {
    format!("session-{}", Uuid::new_v4())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running { round: u32 },
    Scoring { round: u32 },
    Completed { target_reached: bool },
    Failed { reason: String },
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed { .. }
                | SessionStatus::Failed { .. }
                | SessionStatus::Cancelled
        )
    }
}

/// One generate, render, score cycle. Appended once fully formed.
#[derive(Debug, Clone, Serialize)]
pub struct Iteration {
    pub round: u32,
    pub code: String,
    pub render_errors: Vec<RenderIssue>,
    /// Set when the gateway produced nothing this round.
    pub generation_error: Option<String>,
    pub fell_back: bool,
    #[serde(skip)]
    pub image: Option<Arc<RgbaImage>>,
    /// Score on the session scale.
    pub score: f64,
    pub raw_score: f64,
    pub raw_scale: ScoreScale,
    pub feedback: String,
    pub instructions: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl Iteration {
    pub fn has_code(&self) -> bool {
        self.generation_error.is_none() && !self.code.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub config: SessionConfig,
    #[serde(skip)]
    pub target: Arc<TargetImage>,
    pub status: SessionStatus,
    pub iterations: Vec<Iteration>,
    pub best: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(id: SessionId, config: SessionConfig, target: Arc<TargetImage>) -> Self {
        Self {
            id,
            config,
            target,
            status: SessionStatus::Created,
            iterations: Vec::new(),
            best: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn best_iteration(&self) -> Option<&Iteration> {
        self.best.and_then(|idx| self.iterations.get(idx))
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best_iteration().map(|it| it.score)
    }

    pub fn current_round(&self) -> u32 {
        match self.status {
            SessionStatus::Running { round } | SessionStatus::Scoring { round } => round,
            _ => self.iterations.last().map(|it| it.round).unwrap_or(0),
        }
    }

    /// Appends and moves `best` only on a strictly greater score, so ties keep the earliest round.
    pub fn record(&mut self, iteration: Iteration) {
        let improves = match self.best_score() {
            Some(best) => iteration.score > best,
            None => true,
        };
        self.iterations.push(iteration);
        if improves {
            self.best = Some(self.iterations.len() - 1);
        }
    }

    pub fn finish(&mut self, status: SessionStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn target_reached(&self) -> bool {
        matches!(self.status, SessionStatus::Completed { target_reached: true })
    }

    pub fn progress(&self) -> Progress {
        Progress {
            id: self.id.clone(),
            status: self.status.clone(),
            current_round: self.current_round(),
            max_rounds: self.config.max_rounds,
            best_score: self.best_score(),
            best_round: self.best_iteration().map(|it| it.round),
            history: self.iterations.iter().map(RoundSummary::from).collect(),
        }
    }

    pub fn summary(&self) -> Summary {
        let best = self.best_iteration();
        Summary {
            id: self.id.clone(),
            status: self.status.clone(),
            target_reached: self.target_reached(),
            target_score: self.config.target_score,
            scale: self.config.score_scale,
            evaluator: self.config.evaluator.as_str(),
            best_round: best.map(|it| it.round),
            best_score: best.map(|it| it.score),
            best_code: best.map(|it| it.code.clone()),
            rounds: self.iterations.iter().map(RoundSummary::from).collect(),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundSummary {
    pub round: u32,
    pub score: f64,
    pub feedback: String,
    pub render_errors: usize,
    pub generation_error: Option<String>,
}

impl From<&Iteration> for RoundSummary {
    fn from(it: &Iteration) -> Self {
        Self {
            round: it.round,
            score: it.score,
            feedback: it.feedback.clone(),
            render_errors: it.render_errors.len(),
            generation_error: it.generation_error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub id: SessionId,
    pub status: SessionStatus,
    pub current_round: u32,
    pub max_rounds: u32,
    pub best_score: Option<f64>,
    pub best_round: Option<u32>,
    pub history: Vec<RoundSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub id: SessionId,
    pub status: SessionStatus,
    pub target_reached: bool,
    pub target_score: f64,
    pub scale: ScoreScale,
    pub evaluator: &'static str,
    pub best_round: Option<u32>,
    pub best_score: Option<f64>,
    pub best_code: Option<String>,
    pub rounds: Vec<RoundSummary>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Checked by the orchestrator at the top of each round.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub enum SessionEvent<'a> {
    StatusChanged {
        session: &'a Session,
    },
    RoundCompleted {
        session: &'a Session,
        iteration: &'a Iteration,
        evaluation: Option<&'a Evaluation>,
    },
    Finished {
        session: &'a Session,
    },
}

impl<'a> SessionEvent<'a> {
    pub fn session(&self) -> &'a Session {
        match self {
            SessionEvent::StatusChanged { session }
            | SessionEvent::RoundCompleted { session, .. }
            | SessionEvent::Finished { session } => session,
        }
    }
}

/// Side channel for round-level progress. Implementations must not block for long.
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: &SessionEvent<'_>);
}

impl ProgressObserver for () {
    fn on_event(&self, _event: &SessionEvent<'_>) {}
}

impl<O: ProgressObserver> ProgressObserver for Option<O> {
    fn on_event(&self, event: &SessionEvent<'_>) {
        if let Some(observer) = self {
            observer.on_event(event);
        }
    }
}

impl<A: ProgressObserver, B: ProgressObserver> ProgressObserver for (A, B) {
    fn on_event(&self, event: &SessionEvent<'_>) {
        self.0.on_event(event);
        self.1.on_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{iteration, red_square_target};

    fn session() -> Session {
        let target = TargetImage::from_image(red_square_target()).unwrap();
        Session::new(new_session_id(), SessionConfig::default(), Arc::new(target))
    }

    #[test]
    fn ids_are_prefixed_and_unique() {
        let a = new_session_id();
        assert!(a.starts_with("session-"));
        assert_ne!(a, new_session_id());
    }

    #[test]
    fn best_tracks_strict_maximum_and_keeps_earliest_tie() {
        let mut session = session();
        for (round, score) in [(1, 40.0), (2, 70.0), (3, 70.0), (4, 10.0)] {
            session.record(iteration(round, score));
            let max = session.iterations.iter().map(|it| it.score).fold(f64::MIN, f64::max);
            assert_eq!(session.best_score(), Some(max));
        }
        assert_eq!(session.best_iteration().unwrap().round, 2);
    }

    #[test]
    fn progress_reports_history_and_round() {
        let mut session = session();
        session.record(iteration(1, 30.0));
        session.status = SessionStatus::Running { round: 2 };
        let progress = session.progress();
        assert_eq!(progress.current_round, 2);
        assert_eq!(progress.best_round, Some(1));
        assert_eq!(progress.history.len(), 1);
    }

    #[test]
    fn summary_labels_unreached_target() {
        let mut session = session();
        session.record(iteration(1, 30.0));
        session.finish(SessionStatus::Completed { target_reached: false });
        let summary = session.summary();
        assert!(!summary.target_reached);
        assert_eq!(summary.best_round, Some(1));
        assert!(summary.finished_at.is_some());
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["status"]["state"], "completed");
    }

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::default();
        let other = flag.clone();
        other.cancel();
        assert!(flag.is_cancelled());
    }
}
