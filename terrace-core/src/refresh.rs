//! Refresh - Reconcile persisted records with what the provider reports
//!
//! Records whose object has vanished are dropped from the working state so
//! the next plan creates them again. For surviving records the last-known
//! attributes are updated, and an argument whose live value no longer matches
//! the recorded one gets the live value's hash, so the differ plans an update
//! back to the declared value.

use std::collections::HashMap;

use crate::provider::{Provider, ProviderError};
use crate::resource::{ResourceId, State};

/// Read every record back through `provider`
pub async fn refresh_states<P>(
    provider: &P,
    mut states: HashMap<ResourceId, State>,
) -> Result<HashMap<ResourceId, State>, ProviderError>
where
    P: Provider + ?Sized,
{
    let mut refreshed = HashMap::with_capacity(states.len());
    let mut ids: Vec<ResourceId> = states.keys().cloned().collect();
    ids.sort();

    for id in ids {
        let Some(mut record) = states.remove(&id) else {
            continue;
        };
        let Some(identifier) = record.identifier.clone() else {
            refreshed.insert(id, record);
            continue;
        };

        let current = provider
            .read(&id, Some(&identifier))
            .await
            .map_err(|e| e.for_resource(id.clone()))?;
        if !current.exists {
            log::info!("{} ({}) no longer exists", id, identifier);
            continue;
        }

        for (name, hash) in record.argument_hashes.iter_mut() {
            if let (Some(live), Some(last)) =
                (current.attributes.get(name), record.attributes.get(name))
                && live != last
            {
                log::info!("{}.{} changed outside of Terrace", id, name);
                *hash = live.content_hash();
            }
        }
        record.attributes.extend(current.attributes);
        refreshed.insert(id, record);
    }
    Ok(refreshed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{BoxFuture, ProviderResult};
    use crate::resource::{Resource, Value};

    /// Knows a single live object
    struct OneObject;

    impl Provider for OneObject {
        fn name(&self) -> &'static str {
            "test"
        }

        fn read(
            &self,
            id: &ResourceId,
            identifier: Option<&str>,
        ) -> BoxFuture<'_, ProviderResult<State>> {
            let id = id.clone();
            let alive = identifier == Some("live");
            Box::pin(async move {
                if alive {
                    let mut attrs = HashMap::new();
                    attrs.insert("arn".to_string(), Value::String("arn:new".to_string()));
                    attrs.insert("name".to_string(), Value::String("live".to_string()));
                    attrs.insert(
                        "versioning".to_string(),
                        Value::String("Suspended".to_string()),
                    );
                    Ok(State::existing(id, attrs).with_identifier("live"))
                } else {
                    Ok(State::not_found(id))
                }
            })
        }

        fn create(&self, _resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
            Box::pin(async { Err(ProviderError::new("unsupported")) })
        }

        fn update(
            &self,
            _id: &ResourceId,
            _identifier: &str,
            _from: &State,
            _to: &Resource,
        ) -> BoxFuture<'_, ProviderResult<State>> {
            Box::pin(async { Err(ProviderError::new("unsupported")) })
        }

        fn delete(&self, _id: &ResourceId, _identifier: &str) -> BoxFuture<'_, ProviderResult<()>> {
            Box::pin(async { Err(ProviderError::new("unsupported")) })
        }
    }

    fn record(name: &str, identifier: Option<&str>) -> State {
        let mut attrs = HashMap::new();
        attrs.insert("arn".to_string(), Value::String("arn:old".to_string()));
        attrs.insert("name".to_string(), Value::String(name.to_string()));
        let mut hashes = HashMap::new();
        hashes.insert("name".to_string(), "h".to_string());
        hashes.insert("versioning".to_string(), "v".to_string());
        let state = State::existing(ResourceId::new("aws.s3.bucket", name), attrs)
            .with_argument_hashes(hashes);
        match identifier {
            Some(identifier) => state.with_identifier(identifier),
            None => state,
        }
    }

    #[tokio::test]
    async fn vanished_records_are_dropped() {
        let live = record("live", Some("live"));
        let gone = record("gone", Some("gone"));
        let unknown = record("unknown", None);
        let states: HashMap<_, _> = [live.clone(), gone.clone(), unknown.clone()]
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();

        let refreshed = refresh_states(&OneObject, states).await.unwrap();

        assert!(!refreshed.contains_key(&gone.id));
        assert_eq!(refreshed.get(&unknown.id), Some(&unknown));

        let live_record = &refreshed[&live.id];
        assert_eq!(
            live_record.attributes.get("arn"),
            Some(&Value::String("arn:new".to_string()))
        );
        assert_eq!(
            live_record.attributes.get("name"),
            Some(&Value::String("live".to_string()))
        );
        assert_eq!(live_record.argument_hashes, live.argument_hashes);
    }

    #[tokio::test]
    async fn changed_arguments_take_the_live_hash() {
        let mut live = record("live", Some("live"));
        live.attributes.insert(
            "versioning".to_string(),
            Value::String("Enabled".to_string()),
        );
        let states: HashMap<_, _> = [(live.id.clone(), live.clone())].into_iter().collect();

        let refreshed = refresh_states(&OneObject, states).await.unwrap();

        let hashes = &refreshed[&live.id].argument_hashes;
        assert_eq!(hashes["name"], "h");
        assert_eq!(
            hashes["versioning"],
            Value::String("Suspended".to_string()).content_hash()
        );
        assert_ne!(
            hashes["versioning"],
            Value::String("Enabled".to_string()).content_hash()
        );
    }
}
