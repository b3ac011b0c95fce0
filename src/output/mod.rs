use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::chat::{ChatClient, ChatError};
use crate::jobs::Requester;
use crate::utils::generate_unique_filename;

/// Something handed to [`LocalDelivery`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    File {
        to: Requester,
        path: PathBuf,
        caption: String,
    },
    Notice {
        to: Requester,
        message: String,
    },
}

/// Chat client for the command line: delivered files are copied into a
/// directory and notices are printed to the console
#[derive(Debug)]
pub struct LocalDelivery {
    output_dir: PathBuf,
    print: bool,
    delivered: Mutex<Vec<Delivery>>,
}

impl LocalDelivery {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            print: true,
            delivered: Mutex::new(Vec::new()),
        }
    }

    /// Record deliveries without printing them
    pub fn quiet(mut self) -> Self {
        self.print = false;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Everything delivered so far, oldest first
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.delivered
            .lock()
            .map(|d| d.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Path of the last file saved, if any
    pub fn last_file(&self) -> Option<PathBuf> {
        self.deliveries().into_iter().rev().find_map(|d| match d {
            Delivery::File { path, .. } => Some(path),
            Delivery::Notice { .. } => None,
        })
    }

    fn record(&self, delivery: Delivery) {
        match self.delivered.lock() {
            Ok(mut d) => d.push(delivery),
            Err(poisoned) => poisoned.into_inner().push(delivery),
        }
    }
}

#[async_trait]
impl ChatClient for LocalDelivery {
    async fn send_file(
        &self,
        to: &Requester,
        path: &Path,
        caption: &str,
    ) -> Result<(), ChatError> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("media");
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("bin");

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let target = self
            .output_dir
            .join(generate_unique_filename(stem, extension));
        tokio::fs::copy(path, &target).await?;

        if self.print {
            println!("{}", caption);
            println!("File saved to: {}", target.display());
        }

        self.record(Delivery::File {
            to: to.clone(),
            path: target,
            caption: caption.to_string(),
        });
        Ok(())
    }

    async fn send_text(&self, to: &Requester, message: &str) -> Result<(), ChatError> {
        if self.print {
            println!("{}", message);
        }
        self.record(Delivery::Notice {
            to: to.clone(),
            message: message.to_string(),
        });
        Ok(())
    }
}
