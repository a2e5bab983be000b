use crate::gateway::CodeGenGateway;
use crate::render::{describe_issues, RenderContext, RenderIssue, Viewport};
use crate::retry::RetryPolicy;
use image::RgbaImage;
use log::{debug, warn};
use std::time::Duration;

/// Source that rendered cleanly earlier in the session.
#[derive(Debug, Clone, Copy)]
pub struct KnownGood<'a> {
    pub code: &'a str,
    pub image: &'a RgbaImage,
}

#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub code: String,
    /// Empty unless every attempt failed.
    pub errors: Vec<RenderIssue>,
    pub image: Option<RgbaImage>,
    pub render_calls: u32,
    pub fell_back: bool,
}

impl RepairOutcome {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Render, and while the render is unclean ask the gateway for a fix, at most
/// `policy.max_attempts` times. Never fails: an exhausted loop returns the
/// known-good source if there is one, else the last attempt with its errors.
pub async fn ensure_renderable<C, G>(
    ctx: &mut C,
    gateway: &G,
    code: String,
    viewport: Viewport,
    policy: &RetryPolicy,
    timeout: Duration,
    known_good: Option<KnownGood<'_>>,
) -> RepairOutcome
where
    C: RenderContext,
    G: CodeGenGateway,
{
    let mut current = code;
    let mut render_calls = 0;
    let mut attempt = 0;

    let (issues, image) = loop {
        render_calls += 1;
        let (issues, image) = match ctx.capture(&current, viewport, timeout).await {
            Ok(capture) => (capture.issues(), Some(capture.image)),
            Err(err) => (vec![RenderIssue::from(err)], None),
        };
        if issues.is_empty() {
            return RepairOutcome {
                code: current,
                errors: Vec::new(),
                image,
                render_calls,
                fell_back: false,
            };
        }
        if attempt >= policy.max_attempts {
            break (issues, image);
        }

        attempt += 1;
        if attempt > 1 {
            policy.pause(attempt - 1).await;
        }
        let description = describe_issues(&issues);
        debug!("repair attempt {attempt}/{}: {description}", policy.max_attempts);
        match gateway.repair(&current, &description, attempt).await {
            Ok(fixed) => current = fixed,
            Err(err) => {
                warn!("repair attempt {attempt} failed: {err}");
                break (issues, image);
            }
        }
    };

    match known_good {
        Some(good) => {
            warn!(
                "render still failing after {attempt} repair attempt(s), \
                 falling back to last clean sketch"
            );
            RepairOutcome {
                code: good.code.to_string(),
                errors: issues,
                image: Some(good.image.clone()),
                render_calls,
                fell_back: true,
            }
        }
        None => {
            warn!("render still failing after {attempt} repair attempt(s), keeping last attempt");
            RepairOutcome {
                code: current,
                errors: issues,
                image,
                render_calls,
                fell_back: false,
            }
        }
    }
}
