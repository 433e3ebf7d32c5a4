use anyhow::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::expert::backend::Expert;
use crate::expert::output::ExpertOutput;
use crate::frame::Frame;

/// Reports payload size, a short digest and the frame's age at dispatch.
pub struct FrameInfoExpert {
    name: String,
}

#[derive(Serialize)]
struct FrameInfo {
    bytes: usize,
    digest: String,
    age_ms: u64,
}

impl FrameInfoExpert {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Expert for FrameInfoExpert {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, frame: &Frame) -> Result<ExpertOutput> {
        let digest = Sha256::digest(frame.payload());
        ExpertOutput::json(&FrameInfo {
            bytes: frame.payload().len(),
            digest: hex::encode(&digest[..4]),
            age_ms: frame.age().as_millis() as u64,
        })
    }
}
