use crate::codex::CodexExec;
use crate::error::GatewayError;
use crate::render::Viewport;
use crate::retry::RetryPolicy;
use crate::target::TargetImage;
use log::{debug, warn};
use std::future::Future;
use std::path::Path;
use std::time::Duration;

pub const P5_CDN: &str = "https://cdn.jsdelivr.net/npm/p5@1.9.4/lib/p5.min.js";

#[derive(Debug, Clone, Copy)]
pub struct InitialRequest<'a> {
    pub target: &'a TargetImage,
    pub viewport: Viewport,
    pub prompt_override: Option<&'a str>,
}

#[derive(Debug, Clone, Copy)]
pub struct ImproveRequest<'a> {
    pub target: &'a TargetImage,
    pub previous_source: &'a str,
    pub feedback: &'a str,
    pub round: u32,
    pub viewport: Viewport,
    pub prompt_override: Option<&'a str>,
    /// Feedback from recent rounds, oldest first.
    pub history: &'a [String],
}

/// Whatever service writes and repairs sketch source.
pub trait CodeGenGateway: Send + Sync {
    fn generate_initial(
        &self,
        request: InitialRequest<'_>,
    ) -> impl Future<Output = Result<String, GatewayError>> + Send;

    fn generate_improved(
        &self,
        request: ImproveRequest<'_>,
    ) -> impl Future<Output = Result<String, GatewayError>> + Send;

    fn repair(
        &self,
        broken_source: &str,
        error_description: &str,
        attempt: u32,
    ) -> impl Future<Output = Result<String, GatewayError>> + Send;
}

/// Generates sketches through `codex exec`, attaching the target image.
#[derive(Debug, Clone)]
pub struct CodexGateway {
    pub bin: String,
    pub model: Option<String>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl CodexGateway {
    async fn exec(
        &self,
        prompt: String,
        target: Option<&TargetImage>,
        viewport: Viewport,
    ) -> Result<String, GatewayError> {
        let scratch = tempfile::tempdir().map_err(|err| GatewayError::Io(err.to_string()))?;
        let mut images = Vec::new();
        if let Some(target) = target {
            let path = scratch.path().join("target.png");
            stage_image(target, &path)?;
            images.push(path);
        }

        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        let reply = loop {
            let exec = CodexExec {
                bin: self.bin.clone(),
                model: self.model.clone(),
                prompt: prompt.clone(),
                images: images.clone(),
                timeout: self.timeout,
            };
            match exec.run().await {
                Ok(reply) => break reply,
                Err(err) if err.is_transient() && attempt < attempts => {
                    warn!("codex attempt {attempt}/{attempts} failed: {err}");
                    self.retry.pause(attempt).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        };
        drop(scratch);
        extract_sketch(&reply, viewport)
    }
}

fn stage_image(target: &TargetImage, path: &Path) -> Result<(), GatewayError> {
    target
        .image()
        .save(path)
        .map_err(|err| GatewayError::Io(format!("failed to stage target image: {err}")))
}

impl CodeGenGateway for CodexGateway {
    async fn generate_initial(&self, request: InitialRequest<'_>) -> Result<String, GatewayError> {
        let prompt = initial_prompt(&request);
        self.exec(prompt, Some(request.target), request.viewport).await
    }

    async fn generate_improved(&self, request: ImproveRequest<'_>) -> Result<String, GatewayError> {
        let prompt = improve_prompt(&request);
        self.exec(prompt, Some(request.target), request.viewport).await
    }

    async fn repair(
        &self,
        broken_source: &str,
        error_description: &str,
        attempt: u32,
    ) -> Result<String, GatewayError> {
        let viewport = viewport_hint(broken_source).unwrap_or_default();
        let prompt = repair_prompt(broken_source, error_description, attempt);
        self.exec(prompt, None, viewport).await
    }
}

fn output_rules(viewport: Viewport) -> String {
    format!(
        "Use createCanvas({w}, {h}) and draw one static frame (call noLoop()).\n\
         Reply with a single ```html block holding a complete page that loads p5 from {P5_CDN}.",
        w = viewport.width,
        h = viewport.height
    )
}

fn initial_prompt(request: &InitialRequest<'_>) -> String {
    let mut prompt = format!(
        "Write a P5.js sketch that reproduces the attached image as closely as possible \
         on a {}x{} canvas.\n{}",
        request.viewport.width,
        request.viewport.height,
        output_rules(request.viewport)
    );
    append_override(&mut prompt, request.prompt_override);
    prompt
}

fn improve_prompt(request: &ImproveRequest<'_>) -> String {
    let mut prompt = format!(
        "Round {round}. Improve this P5.js sketch so it matches the attached image \
         more closely.\n\n\
         Current sketch:\n```html\n{source}\n```\n\nFeedback on the current sketch:\n{feedback}\n",
        round = request.round,
        source = request.previous_source.trim(),
        feedback = request.feedback.trim(),
    );
    if !request.history.is_empty() {
        prompt.push_str(
            "\nFeedback from earlier rounds (do not repeat fixes that did not help):\n",
        );
        for entry in request.history {
            prompt.push_str("- ");
            prompt.push_str(&entry.replace('\n', "; "));
            prompt.push('\n');
        }
    }
    prompt.push('\n');
    prompt.push_str(&output_rules(request.viewport));
    append_override(&mut prompt, request.prompt_override);
    prompt
}

fn repair_prompt(broken_source: &str, error_description: &str, attempt: u32) -> String {
    format!(
        "Repair attempt {attempt}. This P5.js page fails at runtime:\n{error_description}\n\n\
         ```html\n{}\n```\n\nFix the errors without changing what the sketch draws. \
         Reply with a single ```html block holding the complete corrected page.",
        broken_source.trim()
    )
}

fn append_override(prompt: &mut String, prompt_override: Option<&str>) {
    if let Some(extra) = prompt_override.map(str::trim).filter(|s| !s.is_empty()) {
        prompt.push_str("\n\nAdditional instructions:\n");
        prompt.push_str(extra);
    }
}

/// Pulls runnable page source out of a model reply, wrapping bare P5.js in a page.
pub fn extract_sketch(reply: &str, viewport: Viewport) -> Result<String, GatewayError> {
    let body = fenced_block(reply).unwrap_or(reply).trim();
    if body.is_empty() {
        return Err(GatewayError::EmptyReply);
    }
    let lower = body.to_ascii_lowercase();
    if lower.contains("<html") || lower.starts_with("<!doctype") {
        return Ok(body.to_string());
    }
    if lower.contains("function setup") || lower.contains("createcanvas") {
        debug!("wrapping bare p5 script in a page");
        return Ok(wrap_p5(body, viewport));
    }
    Err(GatewayError::EmptyReply)
}

fn fenced_block(reply: &str) -> Option<&str> {
    let mut blocks = Vec::new();
    let mut rest = reply;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        let (lang, body_start) = match after.find('\n') {
            Some(nl) => (after[..nl].trim(), nl + 1),
            None => return blocks.first().map(|(_, b)| *b),
        };
        let body = &after[body_start..];
        let Some(end) = body.find("```") else {
            break;
        };
        blocks.push((lang, &body[..end]));
        rest = &body[end + 3..];
    }
    blocks
        .iter()
        .find(|(lang, _)| lang.eq_ignore_ascii_case("html"))
        .or_else(|| blocks.first())
        .map(|(_, body)| *body)
}

pub fn wrap_p5(script: &str, viewport: Viewport) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width={w}, height={h}\">\n\
         <script src=\"{P5_CDN}\"></script>\n\
         <style>html, body {{ margin: 0; padding: 0; overflow: hidden; \
         background: #fff; }}</style>\n\
         </head>\n<body>\n<script>\n{script}\n</script>\n</body>\n</html>\n",
        w = viewport.width,
        h = viewport.height
    )
}

fn viewport_hint(source: &str) -> Option<Viewport> {
    let start = source.find("createCanvas(")? + "createCanvas(".len();
    let args = &source[start..];
    let end = args.find(')')?;
    let mut parts = args[..end].split(',').map(str::trim);
    let width = parts.next()?.parse().ok()?;
    let height = parts.next()?.parse().ok()?;
    Some(Viewport { width, height })
}
