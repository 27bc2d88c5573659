//! In-memory [`ObjectStore`] used by the unit and scenario tests.
//!
//! Objects are kept as JSON keyed by kind and `namespace/name`. The store
//! records every call, assigns uid/resourceVersion/creationTimestamp, enforces
//! the resource version on update and fills in a handful of fields the API
//! server would default (service cluster IPs and node ports, job controller
//! labels, workload status) so the equality layer is exercised against
//! realistic "current" objects.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use kube::core::ErrorResponse;
use serde_json::{json, Value};

use crate::store::{object_key, Object, ObjectStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Create,
    Update,
    Delete,
    List,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    pub kind: String,
    pub key: String,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<(String, String), Value>,
    calls: Vec<Call>,
    counter: u64,
    failures: Vec<(Verb, String, u16)>,
    deletion_delays: BTreeMap<String, u32>,
    terminating: BTreeMap<(String, String), u32>,
}

#[derive(Default)]
pub struct FakeStore {
    inner: Mutex<Inner>,
}

pub fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}

fn reason_for(code: u16) -> &'static str {
    match code {
        404 => "NotFound",
        409 => "Conflict",
        500 => "InternalError",
        _ => "BadRequest",
    }
}

impl FakeStore {
    pub fn new() -> Self {
        FakeStore::default()
    }

    /// Store an object as if it had been created out of band.
    pub fn seed<K: Object>(&self, obj: K) {
        let mut inner = self.inner.lock().unwrap();
        let mut value = serde_json::to_value(&obj).unwrap();
        inner.counter += 1;
        let counter = inner.counter;
        let meta = value["metadata"].as_object_mut().unwrap();
        meta.entry("uid").or_insert_with(|| json!(format!("uid-{counter}")));
        meta.entry("resourceVersion").or_insert_with(|| json!(counter.to_string()));
        let key = (K::kind(&()).to_string(), key_of(&value));
        inner.objects.insert(key, value);
    }

    /// Make the next `verb` on `kind` fail with the given HTTP code.
    pub fn fail_next(&self, verb: Verb, kind: &str, code: u16) {
        self.inner.lock().unwrap().failures.push((verb, kind.to_string(), code));
    }

    /// Keep deleted objects of `kind` visible for `attempts` create calls.
    pub fn delay_deletion(&self, kind: &str, attempts: u32) {
        self.inner
            .lock()
            .unwrap()
            .deletion_delays
            .insert(kind.to_string(), attempts);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn count(&self, verb: Verb, kind: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.verb == verb && c.kind == kind)
            .count()
    }

    /// Number of calls with `verb` regardless of kind.
    pub fn count_verb(&self, verb: Verb) -> usize {
        self.calls().iter().filter(|c| c.verb == verb).count()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().unwrap().calls.clear();
    }

    pub fn object<K: Object>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(&(K::kind(&()).to_string(), object_key(namespace, name)))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    pub fn objects<K: Object>(&self) -> Vec<K> {
        let kind = K::kind(&()).to_string();
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, v)| serde_json::from_value(v.clone()).unwrap())
            .collect()
    }

    fn begin(&self, verb: Verb, kind: &str, key: &str) -> Result<std::sync::MutexGuard<'_, Inner>, kube::Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call {
            verb,
            kind: kind.to_string(),
            key: key.to_string(),
        });
        if let Some(pos) = inner
            .failures
            .iter()
            .position(|(v, k, _)| *v == verb && k == kind)
        {
            let (_, _, code) = inner.failures.remove(pos);
            return Err(api_error(code, reason_for(code), format!("injected {verb:?} failure on {kind} {key}")));
        }
        Ok(inner)
    }
}

fn key_of(value: &Value) -> String {
    let name = value["metadata"]["name"].as_str().unwrap_or_default();
    object_key(value["metadata"]["namespace"].as_str(), name)
}

fn not_found(kind: &str, key: &str) -> kube::Error {
    api_error(404, "NotFound", format!("{kind} {key} not found"))
}

fn decode<K: Object>(value: Value) -> Result<K, kube::Error> {
    serde_json::from_value(value).map_err(kube::Error::SerdeError)
}

/// Fields the API server fills in on write.
fn apply_server_defaults(kind: &str, value: &mut Value, counter: u64) {
    let uid = value["metadata"]["uid"].as_str().unwrap_or_default().to_string();
    let name = value["metadata"]["name"].as_str().unwrap_or_default().to_string();
    match kind {
        "Service" => {
            let spec = &mut value["spec"];
            if spec["clusterIP"].is_null() {
                let ip = format!("10.96.0.{}", counter % 250 + 1);
                spec["clusterIP"] = json!(ip);
                spec["clusterIPs"] = json!([ip]);
            }
            let exposes_nodes = matches!(spec["type"].as_str(), Some("NodePort") | Some("LoadBalancer"));
            if let Some(ports) = spec["ports"].as_array_mut() {
                for (i, port) in ports.iter_mut().enumerate() {
                    if exposes_nodes && port["nodePort"].is_null() {
                        port["nodePort"] = json!(30000 + (counter as i64 % 1000) * 2 + i as i64);
                    }
                }
            }
        }
        "Job" => {
            let controller = json!({
                "batch.kubernetes.io/controller-uid": uid,
                "batch.kubernetes.io/job-name": name,
                "controller-uid": uid,
                "job-name": name,
            });
            if value["spec"]["selector"].is_null() {
                value["spec"]["selector"] = json!({"matchLabels": {"batch.kubernetes.io/controller-uid": uid}});
            }
            if value["spec"]["template"]["metadata"]["labels"].is_null() {
                value["spec"]["template"]["metadata"]["labels"] = json!({});
            }
            if let (Some(labels), Some(extra)) = (
                value["spec"]["template"]["metadata"]["labels"].as_object_mut(),
                controller.as_object(),
            ) {
                for (k, v) in extra {
                    labels.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }
        "Deployment" => {
            if value["spec"]["revisionHistoryLimit"].is_null() {
                value["spec"]["revisionHistoryLimit"] = json!(10);
            }
            if value["spec"]["progressDeadlineSeconds"].is_null() {
                value["spec"]["progressDeadlineSeconds"] = json!(600);
            }
            value["status"] = json!({"observedGeneration": 1, "replicas": 0});
        }
        "DaemonSet" => {
            if value["spec"]["revisionHistoryLimit"].is_null() {
                value["spec"]["revisionHistoryLimit"] = json!(10);
            }
            value["status"] = json!({
                "currentNumberScheduled": 0,
                "desiredNumberScheduled": 0,
                "numberMisscheduled": 0,
                "numberReady": 0,
            });
        }
        _ => {}
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<K, kube::Error> {
        let kind = K::kind(&()).to_string();
        let key = object_key(namespace, name);
        let inner = self.begin(Verb::Get, &kind, &key)?;
        match inner.objects.get(&(kind.clone(), key.clone())) {
            Some(value) => decode(value.clone()),
            None => Err(not_found(&kind, &key)),
        }
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K, kube::Error> {
        let kind = K::kind(&()).to_string();
        let mut value = serde_json::to_value(obj).map_err(kube::Error::SerdeError)?;
        let key = key_of(&value);
        let mut inner = self.begin(Verb::Create, &kind, &key)?;
        let id = (kind.clone(), key.clone());
        if inner.objects.contains_key(&id) {
            let gone = match inner.terminating.get_mut(&id) {
                Some(remaining) => {
                    *remaining = remaining.saturating_sub(1);
                    *remaining == 0
                }
                None => false,
            };
            if gone {
                inner.terminating.remove(&id);
                inner.objects.remove(&id);
            }
            return Err(api_error(409, "AlreadyExists", format!("{kind} {key} already exists")));
        }
        inner.counter += 1;
        let counter = inner.counter;
        let meta = &mut value["metadata"];
        meta["uid"] = json!(format!("uid-{counter}"));
        meta["resourceVersion"] = json!(counter.to_string());
        if meta["creationTimestamp"].is_null() {
            meta["creationTimestamp"] = json!(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        }
        apply_server_defaults(&kind, &mut value, counter);
        inner.objects.insert(id, value.clone());
        decode(value)
    }

    async fn update<K: Object>(&self, obj: &K) -> Result<K, kube::Error> {
        let kind = K::kind(&()).to_string();
        let mut value = serde_json::to_value(obj).map_err(kube::Error::SerdeError)?;
        let key = key_of(&value);
        let mut inner = self.begin(Verb::Update, &kind, &key)?;
        let id = (kind.clone(), key.clone());
        let stored_version = match inner.objects.get(&id) {
            Some(stored) => stored["metadata"]["resourceVersion"].clone(),
            None => return Err(not_found(&kind, &key)),
        };
        if value["metadata"]["resourceVersion"] != stored_version {
            return Err(api_error(
                409,
                "Conflict",
                format!("the object {kind} {key} has been modified; please apply your changes to the latest version"),
            ));
        }
        inner.counter += 1;
        let counter = inner.counter;
        value["metadata"]["resourceVersion"] = json!(counter.to_string());
        apply_server_defaults(&kind, &mut value, counter);
        inner.objects.insert(id, value.clone());
        decode(value)
    }

    async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<(), kube::Error> {
        let kind = K::kind(&()).to_string();
        let key = object_key(namespace, name);
        let mut inner = self.begin(Verb::Delete, &kind, &key)?;
        let id = (kind.clone(), key.clone());
        if !inner.objects.contains_key(&id) {
            return Err(not_found(&kind, &key));
        }
        match inner.deletion_delays.get(&kind).copied() {
            Some(attempts) if attempts > 0 => {
                if let Some(obj) = inner.objects.get_mut(&id) {
                    obj["metadata"]["deletionTimestamp"] =
                        json!(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
                }
                inner.terminating.insert(id, attempts);
            }
            _ => {
                inner.objects.remove(&id);
            }
        }
        Ok(())
    }

    async fn list<K: Object>(&self, namespace: Option<&str>) -> Result<Vec<K>, kube::Error> {
        let kind = K::kind(&()).to_string();
        let inner = self.begin(Verb::List, &kind, namespace.unwrap_or_default())?;
        inner
            .objects
            .iter()
            .filter(|((k, _), v)| {
                *k == kind && namespace.map_or(true, |ns| v["metadata"]["namespace"].as_str() == Some(ns))
            })
            .map(|(_, v)| decode(v.clone()))
            .collect()
    }
}
