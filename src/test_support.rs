//! Control-channel doubles shared by the unit tests

use async_trait::async_trait;
use std::sync::Mutex;

use crate::dashboard::ControlChannel;
use crate::Result;

type Responder = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Records every command and answers from a closure
pub struct ScriptedChannel {
    responder: Responder,
    sent: Mutex<Vec<String>>,
}

impl ScriptedChannel {
    pub fn new(responder: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Same reply for every command
    pub fn always(reply: &str) -> Self {
        let reply = reply.to_string();
        Self::new(move |_| reply.clone())
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControlChannel for ScriptedChannel {
    async fn request(&self, command: &str) -> Result<String> {
        self.sent.lock().unwrap().push(command.to_string());
        Ok((self.responder)(command))
    }
}

/// Default controller behaviour: ids for motions, session index 1, success otherwise
pub fn controller_reply(command: &str) -> String {
    let name = command.split('(').next().unwrap_or(command);
    match name {
        "MovJ" | "MovL" => format!("0,{{42}},{};", command),
        "ModbusRTUCreate" => format!("0,{{1}},{};", command),
        _ => format!("0,{{}},{};", command),
    }
}
