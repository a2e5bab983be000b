use crate::codex::CodexExec;
use crate::config::{EvaluatorMode, SessionConfig};
use crate::error::ScoreError;
use crate::pixel_score::{compare_images, PixelVerdict};
use crate::regions::RegionParams;
use crate::util::{round_to, truncate_text};
use image::RgbaImage;
use log::warn;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreScale {
    Ten,
    Twenty,
    Hundred,
}

impl ScoreScale {
    pub fn max(&self) -> f64 {
        match self {
            ScoreScale::Ten => 10.0,
            ScoreScale::Twenty => 20.0,
            ScoreScale::Hundred => 100.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreScale::Ten => "0-10",
            ScoreScale::Twenty => "0-20",
            ScoreScale::Hundred => "0-100",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingPolicy {
    Preserve,
    /// Round half away from zero to a whole number on the target scale.
    Round,
}

/// Converts `value` from one scale to another, clamping to the source range first.
pub fn normalize(value: f64, from: ScoreScale, to: ScoreScale, rounding: RoundingPolicy) -> f64 {
    let clamped = if value.is_finite() {
        value.clamp(0.0, from.max())
    } else {
        0.0
    };
    let converted = clamped / from.max() * to.max();
    match rounding {
        RoundingPolicy::Preserve => round_to(converted, 6),
        RoundingPolicy::Round => converted.round(),
    }
}

/// One evaluator's view of a candidate, on the evaluator's native scale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub score: f64,
    pub scale: ScoreScale,
    pub feedback: String,
    pub instructions: Vec<String>,
    #[serde(skip)]
    pub pixel: Option<PixelVerdict>,
}

pub trait Scorer: Send + Sync {
    fn scale(&self) -> ScoreScale;

    fn score(
        &self,
        target: &RgbaImage,
        candidate: &RgbaImage,
    ) -> impl Future<Output = Result<Evaluation, ScoreError>> + Send;
}

#[derive(Debug, Clone, Default)]
pub struct PixelScorer {
    pub params: RegionParams,
}

impl PixelScorer {
    pub fn new(params: RegionParams) -> Self {
        Self { params }
    }

    pub fn evaluate(&self, target: &RgbaImage, candidate: &RgbaImage) -> Evaluation {
        let verdict = compare_images(target, candidate, &self.params);
        Evaluation {
            score: verdict.score,
            scale: ScoreScale::Hundred,
            feedback: verdict.instructions.join("\n"),
            instructions: verdict.instructions.clone(),
            pixel: Some(verdict),
        }
    }
}

impl Scorer for PixelScorer {
    fn scale(&self) -> ScoreScale {
        ScoreScale::Hundred
    }

    async fn score(
        &self,
        target: &RgbaImage,
        candidate: &RgbaImage,
    ) -> Result<Evaluation, ScoreError> {
        // region positions are only comparable on the same canvas
        if target.dimensions() != candidate.dimensions() {
            return Err(ScoreError::Dimensions {
                expected: target.dimensions(),
                actual: candidate.dimensions(),
            });
        }
        Ok(self.evaluate(target, candidate))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeRole {
    SelfCritique,
    SecondOpinion,
}

#[derive(Debug, Clone)]
pub struct JudgeRequest<'a> {
    pub target: &'a RgbaImage,
    pub candidate: &'a RgbaImage,
    pub role: JudgeRole,
    pub scale: ScoreScale,
    pub prompt: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JudgeVerdict {
    pub score: f64,
    pub feedback: String,
}

/// Remote, non-deterministic grading service.
pub trait JudgeService: Send + Sync {
    fn judge(
        &self,
        request: JudgeRequest<'_>,
    ) -> impl Future<Output = Result<JudgeVerdict, ScoreError>> + Send;
}

pub struct JudgeScorer<J> {
    service: Arc<J>,
    role: JudgeRole,
    scale: ScoreScale,
    prompt: Option<String>,
}

impl<J: JudgeService> JudgeScorer<J> {
    pub fn new(
        service: Arc<J>,
        role: JudgeRole,
        scale: ScoreScale,
        prompt: Option<String>,
    ) -> Self {
        Self {
            service,
            role,
            scale,
            prompt,
        }
    }
}

impl<J: JudgeService> Scorer for JudgeScorer<J> {
    fn scale(&self) -> ScoreScale {
        self.scale
    }

    async fn score(
        &self,
        target: &RgbaImage,
        candidate: &RgbaImage,
    ) -> Result<Evaluation, ScoreError> {
        let verdict = self
            .service
            .judge(JudgeRequest {
                target,
                candidate,
                role: self.role,
                scale: self.scale,
                prompt: self.prompt.as_deref(),
            })
            .await?;
        Ok(Evaluation {
            score: verdict.score.clamp(0.0, self.scale.max()),
            scale: self.scale,
            feedback: verdict.feedback,
            instructions: Vec::new(),
            pixel: None,
        })
    }
}

/// Weighted mean of the pixel and judge scores on a 0-100 scale. If one side
/// fails the other side's score stands alone; if both fail so does the
/// composite.
pub struct CompositeScorer<J> {
    pixel: PixelScorer,
    judge: JudgeScorer<J>,
    pixel_weight: f64,
}

impl<J: JudgeService> CompositeScorer<J> {
    pub fn new(pixel: PixelScorer, judge: JudgeScorer<J>, pixel_weight: f64) -> Self {
        Self {
            pixel,
            judge,
            pixel_weight: pixel_weight.clamp(0.0, 1.0),
        }
    }
}

impl<J: JudgeService> Scorer for CompositeScorer<J> {
    fn scale(&self) -> ScoreScale {
        ScoreScale::Hundred
    }

    async fn score(
        &self,
        target: &RgbaImage,
        candidate: &RgbaImage,
    ) -> Result<Evaluation, ScoreError> {
        let pixel = self.pixel.score(target, candidate).await;
        let judged = self.judge.score(target, candidate).await;
        let (pixel, judged) = match (pixel, judged) {
            (Ok(pixel), Ok(judged)) => (pixel, judged),
            (Ok(pixel), Err(err)) => {
                warn!("judge side of composite failed, using pixel score alone: {err}");
                return Ok(pixel);
            }
            (Err(err), Ok(judged)) => {
                warn!("pixel side of composite failed, using judge score alone: {err}");
                return Ok(Evaluation {
                    score: normalize(
                        judged.score,
                        judged.scale,
                        ScoreScale::Hundred,
                        RoundingPolicy::Preserve,
                    ),
                    scale: ScoreScale::Hundred,
                    ..judged
                });
            }
            (Err(pixel_err), Err(judge_err)) => {
                return Err(ScoreError::Composite(format!(
                    "pixel: {pixel_err}; judge: {judge_err}"
                )));
            }
        };

        let judge_score = normalize(
            judged.score,
            judged.scale,
            ScoreScale::Hundred,
            RoundingPolicy::Preserve,
        );
        let combined = self.pixel_weight * pixel.score + (1.0 - self.pixel_weight) * judge_score;

        let mut feedback = pixel.instructions.join("\n");
        if !judged.feedback.trim().is_empty() {
            if !feedback.is_empty() {
                feedback.push_str("\n\n");
            }
            feedback.push_str(judged.feedback.trim());
        }

        Ok(Evaluation {
            score: round_to(combined, 6),
            scale: ScoreScale::Hundred,
            feedback,
            instructions: pixel.instructions,
            pixel: pixel.pixel,
        })
    }
}

/// The evaluator variants a session can be configured with.
pub enum Evaluator<J> {
    Pixel(PixelScorer),
    Judge(JudgeScorer<J>),
    Composite(CompositeScorer<J>),
}

impl<J: JudgeService> Evaluator<J> {
    pub fn from_config(config: &SessionConfig, judge: Arc<J>) -> Self {
        let pixel = PixelScorer::new(config.region);
        let prompt = config.judge_prompt.clone();
        match config.evaluator {
            EvaluatorMode::Pixel => Evaluator::Pixel(pixel),
            EvaluatorMode::SelfCritique => Evaluator::Judge(JudgeScorer::new(
                judge,
                JudgeRole::SelfCritique,
                ScoreScale::Ten,
                prompt,
            )),
            EvaluatorMode::Judge => Evaluator::Judge(JudgeScorer::new(
                judge,
                JudgeRole::SecondOpinion,
                ScoreScale::Twenty,
                prompt,
            )),
            EvaluatorMode::Composite => Evaluator::Composite(CompositeScorer::new(
                pixel,
                JudgeScorer::new(judge, JudgeRole::SecondOpinion, ScoreScale::Twenty, prompt),
                config.composite_pixel_weight,
            )),
        }
    }
}

impl<J: JudgeService> Scorer for Evaluator<J> {
    fn scale(&self) -> ScoreScale {
        match self {
            Evaluator::Pixel(s) => s.scale(),
            Evaluator::Judge(s) => s.scale(),
            Evaluator::Composite(s) => s.scale(),
        }
    }

    async fn score(
        &self,
        target: &RgbaImage,
        candidate: &RgbaImage,
    ) -> Result<Evaluation, ScoreError> {
        match self {
            Evaluator::Pixel(s) => s.score(target, candidate).await,
            Evaluator::Judge(s) => s.score(target, candidate).await,
            Evaluator::Composite(s) => s.score(target, candidate).await,
        }
    }
}

/// Judge backed by `codex exec` with both images attached.
#[derive(Debug, Clone)]
pub struct CodexJudge {
    pub bin: String,
    pub generator_model: Option<String>,
    pub judge_model: Option<String>,
    pub timeout: Duration,
}

impl JudgeService for CodexJudge {
    async fn judge(&self, request: JudgeRequest<'_>) -> Result<JudgeVerdict, ScoreError> {
        let scratch = tempfile::tempdir().map_err(|err| ScoreError::Judge(err.to_string()))?;
        let target_path = scratch.path().join("target.png");
        let candidate_path = scratch.path().join("candidate.png");
        request
            .target
            .save(&target_path)
            .map_err(|err| ScoreError::Judge(format!("failed to stage target image: {err}")))?;
        request
            .candidate
            .save(&candidate_path)
            .map_err(|err| ScoreError::Judge(format!("failed to stage candidate image: {err}")))?;

        let model = match request.role {
            JudgeRole::SelfCritique => self.generator_model.clone(),
            JudgeRole::SecondOpinion => {
                self.judge_model.clone().or_else(|| self.generator_model.clone())
            }
        };
        let exec = CodexExec {
            bin: self.bin.clone(),
            model,
            prompt: judge_prompt(&request),
            images: vec![target_path, candidate_path],
            timeout: self.timeout,
        };
        let reply = exec.run().await.map_err(|err| ScoreError::Judge(err.to_string()))?;
        drop(scratch);
        parse_verdict(&reply)
    }
}

fn judge_prompt(request: &JudgeRequest<'_>) -> String {
    let who = match request.role {
        JudgeRole::SelfCritique => "You wrote the P5.js sketch that produced the second image.",
        JudgeRole::SecondOpinion => {
            "Another model wrote the P5.js sketch that produced the second image."
        }
    };
    let mut prompt = format!(
        "{who}\nThe first image is the target, the second is the rendered sketch ({}x{}).\n\
         Rate how closely the sketch reproduces the target on a {} scale.\n\
         Reply with a line `SCORE: <number>` followed by at most four concrete corrections \
         using pixel coordinates.",
        request.candidate.width(),
        request.candidate.height(),
        request.scale.as_str()
    );
    if let Some(extra) = request.prompt {
        prompt.push_str("\n\n");
        prompt.push_str(extra.trim());
    }
    prompt
}

/// Pulls the `SCORE: n` line out of a judge reply; the rest is feedback.
pub fn parse_verdict(reply: &str) -> Result<JudgeVerdict, ScoreError> {
    let mut score = None;
    let mut feedback = Vec::new();
    for line in reply.lines() {
        if score.is_none() {
            if let Some(value) = score_in_line(line) {
                score = Some(value);
                continue;
            }
        }
        feedback.push(line);
    }
    let score = score.ok_or_else(|| ScoreError::Unparsable(truncate_text(reply.trim(), 200)))?;
    Ok(JudgeVerdict {
        score,
        feedback: feedback.join("\n").trim().to_string(),
    })
}

/// Accepts `SCORE: 14`, `**Score** = 7.5/10` and the like; the line must
/// lead with the word.
fn score_in_line(line: &str) -> Option<f64> {
    let line = line.trim_start_matches(|c: char| c.is_whitespace() || "*#>-".contains(c));
    let head = line.get(..5)?;
    if !head.eq_ignore_ascii_case("score") {
        return None;
    }
    let rest = line[5..].trim_start_matches(|c: char| c.is_whitespace() || ":=*".contains(c));
    let number: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    number.trim_end_matches('.').parse().ok()
}
