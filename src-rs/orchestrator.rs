use crate::config::{BranchPolicy, SessionConfig};
use crate::error::{GatewayError, ScoreError};
use crate::gateway::{CodeGenGateway, ImproveRequest, InitialRequest};
use crate::render::{RenderContext, Renderer, Viewport};
use crate::repair::{ensure_renderable, KnownGood};
use crate::scorer::{normalize, Evaluation, Scorer};
use crate::session::{CancelFlag, Iteration, ProgressObserver, Session, SessionEvent, SessionStatus};
use crate::util::truncate_text;
use chrono::Utc;
use image::{Rgba, RgbaImage};
use log::{info, warn};
use std::sync::Arc;

const HISTORY_ENTRY_CHARS: usize = 400;

/// Drives one session's rounds against shared services.
pub struct Orchestrator<G, R, S> {
    pub gateway: Arc<G>,
    pub renderer: Arc<R>,
    pub scorer: S,
}

impl<G, R, S> Orchestrator<G, R, S>
where
    G: CodeGenGateway,
    R: Renderer,
    S: Scorer,
{
    pub fn new(gateway: Arc<G>, renderer: Arc<R>, scorer: S) -> Self {
        Self {
            gateway,
            renderer,
            scorer,
        }
    }

    /// Runs `session` to a terminal status and hands it back.
    pub async fn run<O: ProgressObserver>(
        &self,
        mut session: Session,
        observer: &O,
        cancel: &CancelFlag,
    ) -> Session {
        if cancel.is_cancelled() {
            finish(&mut session, observer, SessionStatus::Cancelled);
            return session;
        }

        let mut ctx = match self.renderer.open().await {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!("{}: {err}", session.id);
                finish(&mut session, observer, SessionStatus::Failed { reason: err.to_string() });
                return session;
            }
        };

        let status = self.rounds(&mut session, &mut ctx, observer, cancel).await;
        ctx.close().await;
        finish(&mut session, observer, status);
        session
    }

    async fn rounds<C: RenderContext, O: ProgressObserver>(
        &self,
        session: &mut Session,
        ctx: &mut C,
        observer: &O,
        cancel: &CancelFlag,
    ) -> SessionStatus {
        let config = session.config.clone();
        let target = Arc::clone(&session.target);
        let viewport = Viewport {
            width: target.width(),
            height: target.height(),
        };
        let mut last_clean: Option<(String, Arc<RgbaImage>)> = None;

        for round in 1..=config.max_rounds {
            if cancel.is_cancelled() {
                info!("{}: cancelled before round {round}", session.id);
                return SessionStatus::Cancelled;
            }
            session.status = SessionStatus::Running { round };
            observer.on_event(&SessionEvent::StatusChanged { session: &*session });

            let generated = match self.generate(session, &config, viewport, round).await {
                Ok(code) => code,
                Err(err) if round == 1 => {
                    warn!("{}: round 1 generation failed: {err}", session.id);
                    return SessionStatus::Failed {
                        reason: format!("round 1 produced no code: {err}"),
                    };
                }
                Err(err) => {
                    warn!("{}: round {round} generation failed: {err}", session.id);
                    let iteration =
                        failed_iteration(round, &config, format!("generation failed: {err}"));
                    session.record(iteration);
                    if let Some(iteration) = session.iterations.last() {
                        observer.on_event(&SessionEvent::RoundCompleted {
                            session: &*session,
                            iteration,
                            evaluation: None,
                        });
                    }
                    continue;
                }
            };

            let known_good = last_clean.as_ref().map(|(code, image)| KnownGood {
                code,
                image: image.as_ref(),
            });
            let outcome = ensure_renderable(
                ctx,
                self.gateway.as_ref(),
                generated,
                viewport,
                &config.repair,
                config.render_timeout(),
                known_good,
            )
            .await;
            if !outcome.is_clean() {
                warn!(
                    "{}: round {round} degraded with {} render error(s)",
                    session.id,
                    outcome.errors.len()
                );
            }

            let image = Arc::new(
                outcome
                    .image
                    .unwrap_or_else(|| blank_canvas(viewport.width, viewport.height)),
            );
            if outcome.errors.is_empty() {
                last_clean = Some((outcome.code.clone(), Arc::clone(&image)));
            }

            session.status = SessionStatus::Scoring { round };
            observer.on_event(&SessionEvent::StatusChanged { session: &*session });

            let scored = self.evaluate(target.image(), &image, &config).await;
            let (score, raw_score, raw_scale, feedback, instructions) = match &scored {
                Ok(evaluation) => (
                    normalize(
                        evaluation.score,
                        evaluation.scale,
                        config.score_scale,
                        config.rounding,
                    ),
                    evaluation.score,
                    evaluation.scale,
                    evaluation.feedback.clone(),
                    evaluation.instructions.clone(),
                ),
                Err(err) => {
                    warn!("{}: round {round} scoring failed: {err}", session.id);
                    (0.0, 0.0, self.scorer.scale(), format!("scoring failed: {err}"), Vec::new())
                }
            };

            let iteration = Iteration {
                round,
                code: outcome.code,
                render_errors: outcome.errors,
                generation_error: None,
                fell_back: outcome.fell_back,
                image: Some(Arc::clone(&image)),
                score,
                raw_score,
                raw_scale,
                feedback,
                instructions,
                timestamp: Utc::now(),
            };
            session.record(iteration);
            info!(
                "{}: round {round}/{} scored {score} (best {})",
                session.id,
                config.max_rounds,
                session.best_score().unwrap_or(0.0)
            );
            if let Some(iteration) = session.iterations.last() {
                observer.on_event(&SessionEvent::RoundCompleted {
                    session: &*session,
                    iteration,
                    evaluation: scored.as_ref().ok(),
                });
            }

            if score >= config.target_score {
                info!("{}: target {} reached in round {round}", session.id, config.target_score);
                return SessionStatus::Completed { target_reached: true };
            }
        }

        SessionStatus::Completed { target_reached: false }
    }

    async fn generate(
        &self,
        session: &Session,
        config: &SessionConfig,
        viewport: Viewport,
        round: u32,
    ) -> Result<String, GatewayError> {
        // the gateway caps and retries single attempts itself
        let timeout = config.gateway.budget(config.gateway_timeout());
        let prompt_override = config.custom_prompt.as_deref();
        let base = branch_base(session, config.branch_policy);

        let call = async {
            match base {
                None => {
                    self.gateway
                        .generate_initial(InitialRequest {
                            target: &session.target,
                            viewport,
                            prompt_override,
                        })
                        .await
                }
                Some(base) => {
                    let history = if config.evaluator.uses_feedback_history() {
                        feedback_history(session, base.round, config.history_window)
                    } else {
                        Vec::new()
                    };
                    self.gateway
                        .generate_improved(ImproveRequest {
                            target: &session.target,
                            previous_source: &base.code,
                            feedback: &base.feedback,
                            round,
                            viewport,
                            prompt_override,
                            history: &history,
                        })
                        .await
                }
            }
        };
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                command: "code generation".to_string(),
                after: timeout,
            }),
        }
    }

    async fn evaluate(
        &self,
        target: &RgbaImage,
        candidate: &RgbaImage,
        config: &SessionConfig,
    ) -> Result<Evaluation, ScoreError> {
        let timeout = config.scoring_timeout();
        match tokio::time::timeout(timeout, self.scorer.score(target, candidate)).await {
            Ok(result) => result,
            Err(_) => Err(ScoreError::Timeout(timeout)),
        }
    }
}

fn finish<O: ProgressObserver>(session: &mut Session, observer: &O, status: SessionStatus) {
    info!("{}: finished as {:?}", session.id, status);
    session.finish(status);
    observer.on_event(&SessionEvent::Finished { session: &*session });
}

/// The iteration the next generation builds on.
fn branch_base(session: &Session, policy: BranchPolicy) -> Option<&Iteration> {
    let latest = || session.iterations.iter().rev().find(|it| it.has_code());
    match policy {
        BranchPolicy::FromLast => latest(),
        BranchPolicy::FromBest => session
            .best_iteration()
            .filter(|it| it.has_code())
            .or_else(latest),
    }
}

/// Recent feedback other than the base round's, which is sent on its own.
fn feedback_history(session: &Session, base_round: u32, window: usize) -> Vec<String> {
    let earlier: Vec<&Iteration> = session
        .iterations
        .iter()
        .filter(|it| it.round != base_round && !it.feedback.trim().is_empty())
        .collect();
    let start = earlier.len().saturating_sub(window);
    earlier[start..]
        .iter()
        .map(|it| {
            format!(
                "round {} (score {}): {}",
                it.round,
                it.score,
                truncate_text(it.feedback.trim(), HISTORY_ENTRY_CHARS)
            )
        })
        .collect()
}

fn failed_iteration(round: u32, config: &SessionConfig, error: String) -> Iteration {
    Iteration {
        round,
        code: String::new(),
        render_errors: Vec::new(),
        generation_error: Some(error.clone()),
        fell_back: false,
        image: None,
        score: 0.0,
        raw_score: 0.0,
        raw_scale: config.score_scale,
        feedback: error,
        instructions: Vec::new(),
        timestamp: Utc::now(),
    }
}

pub fn blank_canvas(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]))
}
