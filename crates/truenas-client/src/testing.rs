//! Scripted [`MethodInvoker`] for unit tests.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use truenas_core::{ClientError, FieldValue, Result};
use truenas_ddp::MethodInvoker;

#[derive(Clone)]
enum Scripted {
    Ok(Value),
    Err(String),
}

/// Replies are consumed in order per method; the last one sticks.
#[derive(Default)]
pub(crate) struct ScriptedInvoker {
    replies: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<(String, Vec<Value>)>>,
}

impl ScriptedInvoker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reply(&self, method: &str, result: Value) {
        self.replies
            .lock()
            .entry(method.to_string())
            .or_default()
            .push_back(Scripted::Ok(result));
    }

    pub(crate) fn fail(&self, method: &str, message: &str) {
        self.replies
            .lock()
            .entry(method.to_string())
            .or_default()
            .push_back(Scripted::Err(message.to_string()));
    }

    pub(crate) fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.calls.lock().clone()
    }

    pub(crate) fn calls_to(&self, method: &str) -> Vec<Vec<Value>> {
        self.calls
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }
}

#[async_trait]
impl MethodInvoker for ScriptedInvoker {
    async fn invoke(&self, method: &str, params: Vec<Value>) -> Result<FieldValue> {
        self.calls.lock().push((method.to_string(), params));
        let scripted = {
            let mut replies = self.replies.lock();
            match replies.get_mut(method) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        match scripted {
            Some(Scripted::Ok(value)) => Ok(FieldValue::from(value)),
            Some(Scripted::Err(message)) => Err(ClientError::RemoteMethod {
                method: method.to_string(),
                message,
                errno: None,
            }),
            None => Err(ClientError::RemoteMethod {
                method: method.to_string(),
                message: "method not scripted".to_string(),
                errno: Some(2),
            }),
        }
    }
}
