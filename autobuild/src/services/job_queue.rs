//! Handing committed provisioner jobs to whoever runs them.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::debug;

use crate::constants::defaults::HTTP_TIMEOUT;
use crate::database::ProvisionerJob;

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn post_job(&self, job: &ProvisionerJob) -> Result<()>;
}

/// POSTs each job as JSON to a provisioner endpoint.
#[derive(Clone)]
pub struct HttpJobQueue {
    url: String,
    client: Client,
}

impl HttpJobQueue {
    pub fn new(url: String) -> Result<Self> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl JobQueue for HttpJobQueue {
    async fn post_job(&self, job: &ProvisionerJob) -> Result<()> {
        let response = self.client.post(&self.url).json(job).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "job queue returned status {} for job {}",
                response.status(),
                job.id
            ));
        }
        debug!("Posted provisioner job {}", job.id);
        Ok(())
    }
}

/// Hands jobs to an in-process receiver.
#[derive(Clone)]
pub struct ChannelJobQueue {
    sender: mpsc::UnboundedSender<ProvisionerJob>,
}

impl ChannelJobQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProvisionerJob>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl JobQueue for ChannelJobQueue {
    async fn post_job(&self, job: &ProvisionerJob) -> Result<()> {
        self.sender
            .send(job.clone())
            .map_err(|_| anyhow!("job receiver dropped, job {} not posted", job.id))
    }
}
