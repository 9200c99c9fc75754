//! The seam between the CLI and whatever produces the agents' text: the
//! in-process engine or a remote completion server.

use thiserror::Error;
use tracing::{info, warn};

use crate::backend::{LocalModel, ModelBackend};
use crate::config::{AppConfig, BackendKind, FailurePolicy};
use crate::engine::{EngineError, GenerationEngine};
use crate::prompting::{render_prompt, PromptFamily, PromptRequest};
use crate::remote::{RemoteCompletionClient, RemoteError};

#[derive(Error, Debug)]
pub enum CompletionError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("failed to render chat template: {0}")]
    Template(#[from] minijinja::Error),

    #[error("agent '{agent}' failed: {source}")]
    Agent {
        agent: String,
        #[source]
        source: Box<CompletionError>,
    },
}

impl CompletionError {
    fn for_agent(agent: &str, source: CompletionError) -> Self {
        Self::Agent {
            agent: agent.to_string(),
            source: Box::new(source),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    Completed(String),
    Failed(String),
}

impl AgentOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

pub trait CompletionBackend {
    fn name(&self) -> &'static str;

    /// Called once before any generation.
    fn check_ready(&self) -> Result<(), CompletionError> {
        Ok(())
    }

    /// One outcome per request, in request order. Under
    /// [`FailurePolicy::Abort`] the first failure is returned as `Err`.
    fn tokenize_and_generate(
        &mut self,
        requests: &[PromptRequest],
        max_tokens: usize,
        policy: FailurePolicy,
    ) -> Result<Vec<AgentOutcome>, CompletionError>;
}

fn settle(
    outcomes: &mut Vec<AgentOutcome>,
    agent: &str,
    result: Result<String, CompletionError>,
    policy: FailurePolicy,
) -> Result<(), CompletionError> {
    match (result, policy) {
        (Ok(text), _) => outcomes.push(AgentOutcome::Completed(text)),
        (Err(e), FailurePolicy::Abort) => return Err(CompletionError::for_agent(agent, e)),
        (Err(e), FailurePolicy::Isolate) => {
            warn!(agent, error = %e, "agent failed, continuing with the rest");
            outcomes.push(AgentOutcome::Failed(e.to_string()));
        }
    }
    Ok(())
}

pub struct LocalInferenceBackend<B: ModelBackend> {
    engine: GenerationEngine<B>,
    family: PromptFamily,
    template: Option<String>,
}

impl<B: ModelBackend> LocalInferenceBackend<B> {
    pub fn new(backend: B, family: PromptFamily, template: Option<String>) -> Self {
        Self {
            engine: GenerationEngine::new(backend),
            family,
            template,
        }
    }

    pub fn engine(&self) -> &GenerationEngine<B> {
        &self.engine
    }

    fn complete(
        &mut self,
        request: &PromptRequest,
        max_tokens: usize,
    ) -> Result<String, CompletionError> {
        let prompt = render_prompt(request, self.family, self.template.as_deref())?;
        Ok(self.engine.process(&prompt, max_tokens)?)
    }
}

impl<B: ModelBackend> CompletionBackend for LocalInferenceBackend<B> {
    fn name(&self) -> &'static str {
        "local"
    }

    fn tokenize_and_generate(
        &mut self,
        requests: &[PromptRequest],
        max_tokens: usize,
        policy: FailurePolicy,
    ) -> Result<Vec<AgentOutcome>, CompletionError> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            info!(agent = %request.name, "analyzing");
            let result = self.complete(request, max_tokens);
            settle(&mut outcomes, &request.name, result, policy)?;
        }
        Ok(outcomes)
    }
}

pub struct RemoteHttpBackend {
    client: RemoteCompletionClient,
    model: String,
    batch_size: usize,
}

impl RemoteHttpBackend {
    pub fn new(
        client: RemoteCompletionClient,
        model: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            batch_size: batch_size.max(1),
        }
    }
}

impl CompletionBackend for RemoteHttpBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn check_ready(&self) -> Result<(), CompletionError> {
        self.client.test_connection()?;
        info!(base_url = self.client.base_url(), "completion server reachable");
        Ok(())
    }

    fn tokenize_and_generate(
        &mut self,
        requests: &[PromptRequest],
        max_tokens: usize,
        policy: FailurePolicy,
    ) -> Result<Vec<AgentOutcome>, CompletionError> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for (index, chunk) in requests.chunks(self.batch_size).enumerate() {
            info!(chunk = index, size = chunk.len(), "dispatching requests");
            let results = self.client.complete_batch(chunk, &self.model, max_tokens);
            for (request, result) in chunk.iter().zip(results) {
                settle(&mut outcomes, &request.name, result.map_err(Into::into), policy)?;
            }
        }
        Ok(outcomes)
    }
}

pub fn build_backend(config: &AppConfig) -> Result<Box<dyn CompletionBackend>, CompletionError> {
    match config.backend {
        BackendKind::Local => {
            let model_config = config.model_config();
            let model = LocalModel::load(&model_config)?;
            let family = model.family();
            Ok(Box::new(LocalInferenceBackend::new(
                model,
                family,
                model_config.chat_template,
            )))
        }
        BackendKind::Remote => Ok(Box::new(RemoteHttpBackend::new(
            RemoteCompletionClient::new(&config.remote),
            config.model.clone(),
            config.batch_size,
        ))),
    }
}
