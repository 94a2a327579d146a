use serde::{Deserialize, Serialize};

pub const PROGRESS_DONE: &str = "done";

/// One result returned by the image service. `content` is the prompt the
/// service echoed back for the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub id: String,
    pub hash: String,
    pub progress: String,
    pub uri: String,
    pub content: String,
}

impl GeneratedImage {
    pub fn is_done(&self) -> bool {
        self.progress == PROGRESS_DONE
    }
}
