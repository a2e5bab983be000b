use crate::overlay::annotate_regions;
use crate::pixel_score::analyze;
use crate::scorer::Evaluation;
use crate::session::{Iteration, ProgressObserver, Session, SessionEvent};
use crate::util::{ensure_parent_dir, write_json_pretty, write_text_file};
use anyhow::{Context, Result};
use image::RgbaImage;
use log::{debug, warn};
use serde_json::json;
use std::path::{Path, PathBuf};

/// Writes per-round artifacts and the final summary under `<root>/<session id>/`.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    root: PathBuf,
}

impl ArtifactWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn write_round(
        &self,
        session: &Session,
        iteration: &Iteration,
        evaluation: Option<&Evaluation>,
    ) -> Result<()> {
        let dir = self.session_dir(&session.id);
        let stem = format!("round-{:02}", iteration.round);

        if iteration.has_code() {
            write_text_file(&dir.join(format!("{stem}.html")), &iteration.code)?;
        }
        if let Some(image) = &iteration.image {
            save_png(image, &dir.join(format!("{stem}.png")))?;
        }
        if let Some(verdict) = evaluation.and_then(|e| e.pixel.as_ref()) {
            if let Some(image) = &iteration.image {
                let target_regions = analyze(session.target.image(), &session.config.region);
                let annotated = annotate_regions(image, &target_regions, verdict);
                save_png(&annotated, &dir.join(format!("{stem}-regions.png")))?;
            }
        }

        let record = json!({
            "round": iteration.round,
            "score": iteration.score,
            "scale": session.config.score_scale,
            "raw_score": iteration.raw_score,
            "raw_scale": iteration.raw_scale,
            "feedback": iteration.feedback,
            "instructions": iteration.instructions,
            "render_errors": iteration.render_errors,
            "generation_error": iteration.generation_error,
            "fell_back": iteration.fell_back,
            "matches": evaluation.and_then(|e| e.pixel.as_ref()).map(|v| &v.matches),
            "timestamp": iteration.timestamp.to_rfc3339(),
        });
        write_json_pretty(&dir.join(format!("{stem}.json")), &record)?;
        debug!("wrote {stem} artifacts to {}", dir.display());
        Ok(())
    }

    fn write_summary(&self, session: &Session) -> Result<()> {
        let path = self.session_dir(&session.id).join("summary.json");
        let value = serde_json::to_value(session.summary())?;
        write_json_pretty(&path, &value)
    }
}

fn save_png(image: &RgbaImage, path: &Path) -> Result<()> {
    ensure_parent_dir(path)?;
    image
        .save(path)
        .with_context(|| format!("failed to save image: {}", path.display()))
}

impl ProgressObserver for ArtifactWriter {
    fn on_event(&self, event: &SessionEvent<'_>) {
        let result = match event {
            SessionEvent::RoundCompleted {
                session,
                iteration,
                evaluation,
            } => self.write_round(session, iteration, *evaluation),
            SessionEvent::Finished { session } => self.write_summary(session),
            SessionEvent::StatusChanged { .. } => Ok(()),
        };
        if let Err(err) = result {
            warn!("failed to persist artifacts for {}: {err:#}", event.session().id);
        }
    }
}
