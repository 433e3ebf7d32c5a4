use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::expert::backend::Expert;
use crate::expert::output::ExpertOutput;
use crate::frame::{epoch_secs, Frame};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwards the encoded frame to an HTTP inference server and returns its JSON reply.
///
/// This is how out-of-process detectors and captioners are attached: the
/// server receives the image bytes in the request body and the camera id and
/// capture time in headers.
pub struct RemoteExpert {
    name: String,
    url: String,
    agent: ureq::Agent,
}

impl RemoteExpert {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Option<Duration>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build();
        Self {
            name: name.into(),
            url: url.into(),
            agent,
        }
    }
}

impl Expert for RemoteExpert {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, frame: &Frame) -> Result<ExpertOutput> {
        let response = self
            .agent
            .post(&self.url)
            .set("Content-Type", "application/octet-stream")
            .set("X-Camera-Id", frame.camera_id().as_str())
            .set(
                "X-Capture-Time",
                &format!("{:.3}", epoch_secs(frame.capture_time())),
            )
            .send_bytes(frame.payload())
            .with_context(|| format!("post frame to {}", self.url))?;
        let body: Value = response
            .into_json()
            .with_context(|| format!("decode reply from {}", self.url))?;
        Ok(ExpertOutput::new(body))
    }
}
