//! Image builders and scripted stand-ins for the external services.

use crate::error::{GatewayError, RenderError, ResourceError, ScoreError};
use crate::gateway::{CodeGenGateway, ImproveRequest, InitialRequest};
use crate::render::{Capture, RenderContext, Renderer, Viewport};
use crate::scorer::{Evaluation, JudgeRequest, JudgeService, JudgeVerdict, ScoreScale, Scorer};
use crate::session::Iteration;
use chrono::Utc;
use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Source the scripted renderer always rejects with an uncaught exception.
pub const BROKEN: &str = "<script>BROKEN()</script>";
/// Runs cleanly but never calls `createCanvas`.
pub const NO_CANVAS: &str = "<script>/* no canvas */</script>";

pub fn solid_image(width: u32, height: u32, rgba: [u8; 4]) -> RgbaImage {
    RgbaImage::from_pixel(width, height, Rgba(rgba))
}

pub fn fill_rect(img: &mut RgbaImage, x: u32, y: u32, w: u32, h: u32, rgba: [u8; 4]) {
    let x1 = (x + w).min(img.width());
    let y1 = (y + h).min(img.height());
    for yy in y.min(y1)..y1 {
        for xx in x.min(x1)..x1 {
            img.put_pixel(xx, yy, Rgba(rgba));
        }
    }
}

/// 400x400 white canvas with a 100x100 red square at (150, 150).
pub fn red_square_target() -> RgbaImage {
    let mut img = solid_image(400, 400, [255, 255, 255, 255]);
    fill_rect(&mut img, 150, 150, 100, 100, [230, 30, 30, 255]);
    img
}

pub fn iteration(round: u32, score: f64) -> Iteration {
    Iteration {
        round,
        code: format!("<canvas>round {round}</canvas>"),
        render_errors: Vec::new(),
        generation_error: None,
        fell_back: false,
        image: None,
        score,
        raw_score: score,
        raw_scale: ScoreScale::Hundred,
        feedback: format!("feedback {round}"),
        instructions: Vec::new(),
        timestamp: Utc::now(),
    }
}

pub struct ScriptedJudge {
    score: Option<f64>,
}

impl ScriptedJudge {
    pub fn fixed(score: f64) -> Self {
        Self { score: Some(score) }
    }

    pub fn failing() -> Self {
        Self { score: None }
    }
}

impl JudgeService for ScriptedJudge {
    async fn judge(&self, _request: JudgeRequest<'_>) -> Result<JudgeVerdict, ScoreError> {
        match self.score {
            Some(score) => Ok(JudgeVerdict {
                score,
                feedback: "scripted feedback".to_string(),
            }),
            None => Err(ScoreError::Judge("scripted judge failure".to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImproveCall {
    pub round: u32,
    pub previous_source: String,
    pub feedback: String,
    pub history: Vec<String>,
}

#[derive(Debug, Clone)]
enum RepairBehavior {
    Echo,
    Fixed(String),
    Fail,
}

/// Pops scripted generation results in order; once empty it returns
/// `<canvas>generated N</canvas>` for the Nth generation call.
pub struct ScriptedGateway {
    generations: Mutex<VecDeque<Result<String, GatewayError>>>,
    generated: AtomicU32,
    repair: RepairBehavior,
    calls: Mutex<Vec<String>>,
    improve_calls: Mutex<Vec<ImproveCall>>,
    repair_descriptions: Mutex<Vec<String>>,
}

impl Default for ScriptedGateway {
    fn default() -> Self {
        Self {
            generations: Mutex::new(VecDeque::new()),
            generated: AtomicU32::new(0),
            repair: RepairBehavior::Echo,
            calls: Mutex::new(Vec::new()),
            improve_calls: Mutex::new(Vec::new()),
            repair_descriptions: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedGateway {
    pub fn with_generations(results: Vec<Result<String, GatewayError>>) -> Self {
        Self {
            generations: Mutex::new(results.into()),
            ..Self::default()
        }
    }

    pub fn repairing_to(mut self, code: &str) -> Self {
        self.repair = RepairBehavior::Fixed(code.to_string());
        self
    }

    pub fn failing_repairs(mut self) -> Self {
        self.repair = RepairBehavior::Fail;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn improve_calls(&self) -> Vec<ImproveCall> {
        self.improve_calls.lock().clone()
    }

    pub fn repair_descriptions(&self) -> Vec<String> {
        self.repair_descriptions.lock().clone()
    }

    fn next_generation(&self) -> Result<String, GatewayError> {
        let n = self.generated.fetch_add(1, Ordering::SeqCst) + 1;
        self.generations
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("<canvas>generated {n}</canvas>")))
    }
}

impl CodeGenGateway for ScriptedGateway {
    async fn generate_initial(&self, _request: InitialRequest<'_>) -> Result<String, GatewayError> {
        self.calls.lock().push("initial".to_string());
        self.next_generation()
    }

    async fn generate_improved(&self, request: ImproveRequest<'_>) -> Result<String, GatewayError> {
        self.calls.lock().push(format!("improved:{}", request.round));
        self.improve_calls.lock().push(ImproveCall {
            round: request.round,
            previous_source: request.previous_source.to_string(),
            feedback: request.feedback.to_string(),
            history: request.history.to_vec(),
        });
        self.next_generation()
    }

    async fn repair(
        &self,
        broken_source: &str,
        error_description: &str,
        attempt: u32,
    ) -> Result<String, GatewayError> {
        self.calls.lock().push(format!("repair:{attempt}"));
        self.repair_descriptions.lock().push(error_description.to_string());
        match &self.repair {
            RepairBehavior::Echo => Ok(broken_source.to_string()),
            RepairBehavior::Fixed(code) => Ok(code.clone()),
            RepairBehavior::Fail => Err(GatewayError::EmptyReply),
        }
    }
}

#[derive(Default)]
struct RendererCounters {
    opened: AtomicU32,
    closed: AtomicU32,
    renders: AtomicU32,
}

/// Renders white canvases; [`BROKEN`] source throws, [`NO_CANVAS`] source
/// leaves the page without a canvas, and source containing the timeout
/// marker never finishes loading.
#[derive(Default)]
pub struct ScriptedRenderer {
    counters: Arc<RendererCounters>,
    timeout_marker: Option<String>,
    unavailable: bool,
}

impl ScriptedRenderer {
    pub fn timing_out_on(mut self, marker: &str) -> Self {
        self.timeout_marker = Some(marker.to_string());
        self
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn render_calls(&self) -> u32 {
        self.counters.renders.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> u32 {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u32 {
        self.counters.closed.load(Ordering::SeqCst)
    }
}

impl Renderer for ScriptedRenderer {
    type Context = ScriptedContext;

    async fn open(&self) -> Result<ScriptedContext, ResourceError> {
        if self.unavailable {
            return Err(ResourceError::RendererUnavailable("scripted renderer offline".to_string()));
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedContext {
            counters: Arc::clone(&self.counters),
            timeout_marker: self.timeout_marker.clone(),
        })
    }
}

pub struct ScriptedContext {
    counters: Arc<RendererCounters>,
    timeout_marker: Option<String>,
}

impl RenderContext for ScriptedContext {
    async fn capture(
        &mut self,
        source: &str,
        viewport: Viewport,
        timeout: Duration,
    ) -> Result<Capture, RenderError> {
        self.counters.renders.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = &self.timeout_marker {
            if source.contains(marker.as_str()) {
                return Err(RenderError::Timeout(timeout));
            }
        }
        let uncaught_errors = if source.contains(BROKEN) {
            vec!["ReferenceError: BROKEN is not defined".to_string()]
        } else {
            Vec::new()
        };
        Ok(Capture {
            image: solid_image(viewport.width, viewport.height, [255, 255, 255, 255]),
            console_errors: Vec::new(),
            uncaught_errors,
            has_drawing_surface: !source.contains(NO_CANVAS),
        })
    }

    async fn close(&mut self) {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Returns scripted scores in order, then zero.
pub struct ScriptedScorer {
    scale: ScoreScale,
    scores: Mutex<VecDeque<Result<f64, ScoreError>>>,
    calls: AtomicU32,
}

impl ScriptedScorer {
    pub fn new(scale: ScoreScale, scores: Vec<Result<f64, ScoreError>>) -> Self {
        Self {
            scale,
            scores: Mutex::new(scores.into()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn hundred(scores: &[f64]) -> Self {
        Self::new(ScoreScale::Hundred, scores.iter().copied().map(Ok).collect())
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Scorer for ScriptedScorer {
    fn scale(&self) -> ScoreScale {
        self.scale
    }

    async fn score(
        &self,
        _target: &RgbaImage,
        _candidate: &RgbaImage,
    ) -> Result<Evaluation, ScoreError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let score = self.scores.lock().pop_front().unwrap_or(Ok(0.0))?;
        Ok(Evaluation {
            score,
            scale: self.scale,
            feedback: format!("scripted feedback {n}"),
            instructions: Vec::new(),
            pixel: None,
        })
    }
}

impl<S: Scorer> Scorer for Arc<S> {
    fn scale(&self) -> ScoreScale {
        self.as_ref().scale()
    }

    async fn score(
        &self,
        target: &RgbaImage,
        candidate: &RgbaImage,
    ) -> Result<Evaluation, ScoreError> {
        self.as_ref().score(target, candidate).await
    }
}
