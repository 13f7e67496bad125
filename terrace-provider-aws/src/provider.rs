//! AWS Cloud Control Provider implementation
//!
//! This module contains the main provider implementation that communicates
//! with AWS Cloud Control API to manage resources. Every mutating call
//! returns a request token; the provider polls it until AWS reports a
//! terminal status, so a returned `Ok` means the platform confirmed it.

use std::collections::HashMap;
use std::time::Duration;

use aws_config::Region;
use aws_sdk_cloudcontrol::Client as CloudControlClient;
use aws_sdk_cloudcontrol::error::{DisplayErrorContext, SdkError};
use aws_sdk_cloudcontrol::types::{HandlerErrorCode, OperationStatus};
use terrace_core::provider::{ErrorKind, ProviderError, ProviderResult};
use terrace_core::resource::{Resource, ResourceId, State, Value};

use crate::convert::{
    classify, create_only_properties, from_properties, patch_operations, to_properties,
};
use crate::schemas::{AwsSchemaConfig, config_for};

/// How long and how often to poll an operation's progress
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Terminal outcome of a Cloud Control request
enum Completion {
    Done(String),
    NotFound,
}

fn api_error<E>(action: &str, err: SdkError<E>) -> ProviderError
where
    E: std::error::Error + 'static,
{
    let detail = format!("{:?}", err);
    let error = ProviderError::new(format!("{}: {}", action, DisplayErrorContext(&err)));
    match classify(&detail) {
        ErrorKind::Transient => error.transient(),
        ErrorKind::Permanent => error,
    }
}

/// Error for a request AWS reported as failed
fn failed_operation(code: Option<&str>, message: Option<&str>) -> ProviderError {
    let code = code.unwrap_or("Unknown");
    let error = ProviderError::new(format!(
        "Operation failed ({}): {}",
        code,
        message.unwrap_or("Unknown error")
    ));
    match classify(code) {
        ErrorKind::Transient => error.transient(),
        ErrorKind::Permanent => error,
    }
}

/// The request may still complete after this, so resubmitting it is never safe
fn poll_timeout(request_token: &str, timeout: Duration) -> ProviderError {
    ProviderError::new(format!(
        "Operation {} timed out after {}s",
        request_token,
        timeout.as_secs()
    ))
}

/// Attach the identifier of an object a failed create left behind
fn created_partially(error: ProviderError, identifier: Option<String>) -> ProviderError {
    match identifier {
        Some(identifier) => error.with_identifier(identifier),
        None => error,
    }
}

fn lookup_config(id: &ResourceId) -> ProviderResult<AwsSchemaConfig> {
    config_for(&id.resource_type).ok_or_else(|| {
        ProviderError::new(format!("Unknown resource type: {}", id.resource_type))
            .for_resource(id.clone())
    })
}

/// AWS Cloud Control Provider
pub struct AwsProvider {
    cloudcontrol_client: CloudControlClient,
    region: String,
    poll: PollConfig,
}

impl AwsProvider {
    /// Create a new AwsProvider for the specified region
    pub async fn new(region: &str) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;

        Self {
            cloudcontrol_client: CloudControlClient::new(&config),
            region: region.to_string(),
            poll: PollConfig::default(),
        }
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    // =========================================================================
    // Cloud Control API Methods
    // =========================================================================

    /// Get a resource's properties; `None` when it does not exist
    pub async fn cc_get_resource(
        &self,
        type_name: &str,
        identifier: &str,
    ) -> ProviderResult<Option<serde_json::Value>> {
        let result = self
            .cloudcontrol_client
            .get_resource()
            .type_name(type_name)
            .identifier(identifier)
            .send()
            .await;

        match result {
            Ok(response) => {
                let Some(props) = response.resource_description().and_then(|d| d.properties())
                else {
                    return Ok(None);
                };
                serde_json::from_str(props).map(Some).map_err(|e| {
                    ProviderError::new(format!("Invalid properties for {}: {}", identifier, e))
                })
            }
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_resource_not_found_exception()) =>
            {
                Ok(None)
            }
            Err(e) => Err(api_error("Failed to get resource", e)),
        }
    }

    /// Create a resource and return its primary identifier
    pub async fn cc_create_resource(
        &self,
        type_name: &str,
        desired_state: serde_json::Value,
    ) -> ProviderResult<String> {
        let result = self
            .cloudcontrol_client
            .create_resource()
            .type_name(type_name)
            .desired_state(desired_state.to_string())
            .send()
            .await
            .map_err(|e| api_error("Failed to create resource", e))?;

        let progress = result.progress_event();
        let request_token = progress
            .and_then(|p| p.request_token())
            .ok_or_else(|| ProviderError::new("No request token returned"))?;
        let mut identifier = progress
            .and_then(|p| p.identifier())
            .filter(|i| !i.is_empty())
            .map(str::to_string);

        match self.wait_for_operation(request_token, &mut identifier).await {
            Ok(Completion::Done(identifier)) => Ok(identifier),
            Ok(Completion::NotFound) => Err(ProviderError::new(
                "Create failed: a dependency of the resource was not found",
            )),
            Err(e) => Err(created_partially(e, identifier)),
        }
    }

    /// Apply an RFC 6902 patch to a resource
    pub async fn cc_update_resource(
        &self,
        type_name: &str,
        identifier: &str,
        patch_ops: Vec<serde_json::Value>,
    ) -> ProviderResult<()> {
        if patch_ops.is_empty() {
            return Ok(());
        }

        let patch_document = serde_json::to_string(&patch_ops)
            .map_err(|e| ProviderError::new(format!("Failed to build patch: {}", e)))?;

        let result = self
            .cloudcontrol_client
            .update_resource()
            .type_name(type_name)
            .identifier(identifier)
            .patch_document(patch_document)
            .send()
            .await
            .map_err(|e| api_error("Failed to update resource", e))?;

        if let Some(request_token) = result.progress_event().and_then(|p| p.request_token())
            && let Completion::NotFound = self
                .wait_for_operation(request_token, &mut Some(identifier.to_string()))
                .await?
        {
            return Err(ProviderError::new(format!(
                "Update failed: {} no longer exists",
                identifier
            )));
        }

        Ok(())
    }

    /// Delete a resource. A resource that is already gone counts as deleted.
    pub async fn cc_delete_resource(
        &self,
        type_name: &str,
        identifier: &str,
    ) -> ProviderResult<()> {
        let result = self
            .cloudcontrol_client
            .delete_resource()
            .type_name(type_name)
            .identifier(identifier)
            .send()
            .await;

        let result = match result {
            Ok(result) => result,
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_resource_not_found_exception()) =>
            {
                log::debug!("{} {} is already gone", type_name, identifier);
                return Ok(());
            }
            Err(e) => return Err(api_error("Failed to delete resource", e)),
        };

        if let Some(request_token) = result.progress_event().and_then(|p| p.request_token())
            && let Completion::NotFound = self
                .wait_for_operation(request_token, &mut Some(identifier.to_string()))
                .await?
        {
            log::debug!("{} {} is already gone", type_name, identifier);
        }

        Ok(())
    }

    /// Poll a request until it reaches a terminal status.
    ///
    /// An accepted request is never resubmitted, so transient status-call
    /// errors are retried here until the deadline. `identifier` is updated with
    /// the object identifier as soon as AWS reports one.
    async fn wait_for_operation(
        &self,
        request_token: &str,
        identifier: &mut Option<String>,
    ) -> ProviderResult<Completion> {
        let deadline = tokio::time::Instant::now() + self.poll.timeout;
        let mut delay = self.poll.initial_delay;

        loop {
            let status = self
                .cloudcontrol_client
                .get_resource_request_status()
                .request_token(request_token)
                .send()
                .await;

            match status {
                Ok(status) => {
                    if let Some(progress) = status.progress_event() {
                        if let Some(reported) = progress.identifier().filter(|i| !i.is_empty()) {
                            *identifier = Some(reported.to_string());
                        }
                        match progress.operation_status() {
                            Some(OperationStatus::Success) => {
                                return Ok(Completion::Done(
                                    identifier.clone().unwrap_or_default(),
                                ));
                            }
                            Some(OperationStatus::Failed) => {
                                let code = progress.error_code();
                                if code == Some(&HandlerErrorCode::NotFound) {
                                    return Ok(Completion::NotFound);
                                }
                                return Err(failed_operation(
                                    code.map(|c| c.as_str()),
                                    progress.status_message(),
                                ));
                            }
                            Some(OperationStatus::CancelComplete) => {
                                return Err(ProviderError::new("Operation was cancelled"));
                            }
                            _ => {}
                        }
                    }
                }
                Err(e) => {
                    let error = api_error("Failed to get operation status", e);
                    if !error.is_transient() {
                        return Err(error);
                    }
                    log::warn!("Polling {} failed, retrying: {}", request_token, error);
                }
            }

            if tokio::time::Instant::now() + delay > deadline {
                return Err(poll_timeout(request_token, self.poll.timeout));
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.poll.max_delay);
        }
    }

    // =========================================================================
    // Resource Operations
    // =========================================================================

    /// Read a resource by its identifier
    pub async fn read_resource(
        &self,
        id: &ResourceId,
        identifier: Option<&str>,
    ) -> ProviderResult<State> {
        let config = lookup_config(id)?;

        let Some(identifier) = identifier else {
            return Ok(State::not_found(id.clone()));
        };

        let props = match self
            .cc_get_resource(config.aws_type_name, identifier)
            .await
            .map_err(|e| e.for_resource(id.clone()))?
        {
            Some(props) => props,
            None => return Ok(State::not_found(id.clone())),
        };

        let attributes = from_properties(&config, &props);
        Ok(State::existing(id.clone(), attributes).with_identifier(identifier))
    }

    /// Create a resource, then read back what AWS reports
    pub async fn create_resource(&self, resource: &Resource) -> ProviderResult<State> {
        let config = lookup_config(&resource.id)?;
        let desired_state = to_properties(&config, &resource.attributes);

        log::debug!("Creating {} as {}", resource.id, config.aws_type_name);
        let identifier = self
            .cc_create_resource(
                config.aws_type_name,
                serde_json::Value::Object(desired_state),
            )
            .await
            .map_err(|e| e.for_resource(resource.id.clone()))?;

        let state = self
            .read_resource(&resource.id, Some(&identifier))
            .await
            .map_err(|e| e.with_identifier(identifier.clone()))?;
        if !state.exists {
            return Err(ProviderError::new(format!(
                "{} was created but could not be read back",
                identifier
            ))
            .for_resource(resource.id.clone())
            .with_identifier(identifier));
        }
        Ok(state)
    }

    /// Update a resource in place with a patch of the changed properties
    pub async fn update_resource(
        &self,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> ProviderResult<State> {
        let config = lookup_config(id)?;

        // Only previous arguments form the baseline; read-back defaults are left alone
        let previous: HashMap<String, Value> = from
            .attributes
            .iter()
            .filter(|(k, _)| from.argument_hashes.contains_key(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let current = to_properties(&config, &previous);
        let desired = to_properties(&config, &to.attributes);
        let patch_ops = patch_operations(&current, &desired, &create_only_properties(&config));

        log::debug!("Updating {} with {} patch operations", id, patch_ops.len());
        self.cc_update_resource(config.aws_type_name, identifier, patch_ops)
            .await
            .map_err(|e| e.for_resource(id.clone()))?;

        let state = self.read_resource(id, Some(identifier)).await?;
        if !state.exists {
            return Err(ProviderError::new(format!(
                "{} disappeared during update",
                identifier
            ))
            .for_resource(id.clone()));
        }
        Ok(state)
    }

    /// Delete a resource
    pub async fn delete_resource(&self, id: &ResourceId, identifier: &str) -> ProviderResult<()> {
        let config = lookup_config(id)?;
        log::debug!("Deleting {} ({})", id, identifier);
        self.cc_delete_resource(config.aws_type_name, identifier)
            .await
            .map_err(|e| e.for_resource(id.clone()))
    }
}
