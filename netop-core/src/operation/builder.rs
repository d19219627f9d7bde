use super::inner::{Inner, Parts};
use super::{Operation, OperationSource};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::processor::{
    BoxResultProcessor, Identity, RequestProcessor, ResponseValidator, ResultProcessor,
    SharedRequestProcessor, SharedResponseValidator,
};
use crate::request::Request;
use crate::retry::{RetryProvider, SharedRetryProvider};
use crate::transport::Transport;
use bytes::Bytes;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::debug;

/// Assembles an [`Operation`].
///
/// Unless [`OperationBuilder::retry_providers`] replaces the chain, custom
/// retry providers run before the standard chain built from the
/// [`EngineConfig`].
pub struct OperationBuilder<S, T> {
    request: Request,
    download_to: Option<PathBuf>,
    request_processors: Vec<SharedRequestProcessor>,
    validators: Vec<SharedResponseValidator>,
    result_processor: BoxResultProcessor<S, T>,
    retry_providers: Vec<SharedRetryProvider>,
    use_default_providers: bool,
    transport: Arc<dyn Transport>,
    config: EngineConfig,
}

impl OperationBuilder<Bytes, Bytes> {
    pub(crate) fn new(request: Request, transport: Arc<dyn Transport>) -> Self {
        Self::with_source(request, None, Arc::new(Identity::<Bytes>::new()), transport)
    }
}

impl OperationBuilder<PathBuf, PathBuf> {
    pub(crate) fn download(request: Request, path: PathBuf, transport: Arc<dyn Transport>) -> Self {
        Self::with_source(
            request,
            Some(path),
            Arc::new(Identity::<PathBuf>::new()),
            transport,
        )
    }
}

impl<S: OperationSource, T: Send + Sync + 'static> OperationBuilder<S, T> {
    fn with_source(
        request: Request,
        download_to: Option<PathBuf>,
        result_processor: BoxResultProcessor<S, T>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            request,
            download_to,
            request_processors: Vec::new(),
            validators: Vec::new(),
            result_processor,
            retry_providers: Vec::new(),
            use_default_providers: true,
            transport,
            config: EngineConfig::default(),
        }
    }

    /// Appends a request processor.
    pub fn request_processor(mut self, processor: impl RequestProcessor + 'static) -> Self {
        self.request_processors.push(Arc::new(processor));
        self
    }

    /// Appends a response validator.
    pub fn validator(mut self, validator: impl ResponseValidator + 'static) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    /// Replaces the result processor, changing the operation's result type.
    pub fn result_processor<P>(self, processor: P) -> OperationBuilder<S, P::Output>
    where
        P: ResultProcessor<Source = S>,
        P::Output: Sync,
    {
        OperationBuilder {
            request: self.request,
            download_to: self.download_to,
            request_processors: self.request_processors,
            validators: self.validators,
            result_processor: Arc::new(processor),
            retry_providers: self.retry_providers,
            use_default_providers: self.use_default_providers,
            transport: self.transport,
            config: self.config,
        }
    }

    /// Adds a retry provider ahead of the standard chain.
    pub fn retry_provider(mut self, provider: impl RetryProvider + 'static) -> Self {
        self.retry_providers.push(Arc::new(provider));
        self
    }

    /// Replaces the whole retry chain, dropping the standard providers.
    pub fn retry_providers(mut self, providers: Vec<SharedRetryProvider>) -> Self {
        self.retry_providers = providers;
        self.use_default_providers = false;
        self
    }

    /// Sets the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the operation in [`OperationState::Created`](super::OperationState::Created).
    ///
    /// # Errors
    ///
    /// Fails when the configuration is invalid or when no runtime is
    /// configured and the caller is not inside one.
    pub fn build(self) -> Result<Operation<S, T>> {
        let validation = self.config.validate()?;
        for warning in &validation.warnings {
            debug!(warning = %warning, "Engine configuration warning");
        }

        let runtime = match &self.config.runtime {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|e| {
                Error::other(e).context("Operations need a Tokio runtime; set EngineConfig::runtime")
            })?,
        };

        let mut retry_providers = self.retry_providers;
        if self.use_default_providers {
            retry_providers.extend(self.config.default_retry_providers());
        }

        let inner = Inner::new(Parts {
            destination: S::destination(self.download_to.as_ref()),
            request: self.request,
            request_processors: self.request_processors,
            validators: self.validators,
            result_processor: self.result_processor,
            retry_providers,
            transport: self.transport,
            runtime,
            success_bus: self.config.success_bus.clone(),
            max_presized_body: self.config.max_presized_body,
        });
        Ok(Operation::from_inner(inner))
    }

    /// Builds and starts the operation.
    ///
    /// # Errors
    ///
    /// See [`OperationBuilder::build`].
    pub fn start(self) -> Result<Operation<S, T>> {
        let operation = self.build()?;
        operation.start();
        Ok(operation)
    }
}

impl<S, T> fmt::Debug for OperationBuilder<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationBuilder")
            .field("method", &self.request.method)
            .field("url", &self.request.url.as_str())
            .field("download_to", &self.download_to)
            .field("request_processors", &self.request_processors.len())
            .field("validators", &self.validators.len())
            .field("retry_providers", &self.retry_providers.len())
            .field("use_default_providers", &self.use_default_providers)
            .field("config", &self.config)
            .finish()
    }
}
