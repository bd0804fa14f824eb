use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::command::Executor;
use crate::error::Result;

/// Value of a cgroup parameter as it appears in the topology file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => f.write_str("1"),
            Self::Bool(false) => f.write_str("0"),
            Self::Int(v) => write!(f, "{v}"),
            // Kernel knobs are integral; fractional parts are dropped.
            Self::Float(v) => write!(f, "{}", v.trunc() as i64),
            Self::Str(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Param {
    pub key: String,
    pub value: ParamValue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Controller {
    pub name: String,
    pub params: Vec<Param>,
}

/// Resource-limit group driven through the libcgroup command line tools.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Cgroup {
    pub name: String,
    pub controllers: Vec<Controller>,
}

impl Cgroup {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            controllers: Vec::new(),
        }
    }

    /// Add a controller unless it is already present.
    pub fn add_controller(&mut self, name: &str) {
        if !self.controllers.iter().any(|c| c.name == name) {
            self.controllers.push(Controller {
                name: name.to_string(),
                params: Vec::new(),
            });
        }
    }

    /// Set `key` on `controller`, adding the controller when needed.
    pub fn set_value(&mut self, controller: &str, key: &str, value: ParamValue) {
        self.add_controller(controller);
        let Some(entry) = self.controllers.iter_mut().find(|c| c.name == controller) else {
            return;
        };
        match entry.params.iter_mut().find(|p| p.key == key) {
            Some(param) => param.value = value,
            None => entry.params.push(Param {
                key: key.to_string(),
                value,
            }),
        }
    }

    fn group_spec(&self) -> String {
        let controllers: Vec<&str> = self.controllers.iter().map(|c| c.name.as_str()).collect();
        format!("{}:{}", controllers.join(","), self.name)
    }

    /// Create the group in every declared hierarchy, then write its parameters.
    pub async fn create(&self, executor: &dyn Executor) -> Result<()> {
        if self.controllers.is_empty() {
            debug!(cgroup = %self.name, "no controllers, nothing to create");
            return Ok(());
        }

        let spec = self.group_spec();
        executor.run("cgcreate", &["-g", &spec]).await?;

        for controller in &self.controllers {
            for param in &controller.params {
                let setting = format!("{}={}", param.key, param.value);
                executor
                    .run("cgset", &["-r", &setting, &self.name])
                    .await?;
            }
        }
        debug!(cgroup = %self.name, spec = %spec, "cgroup created");
        Ok(())
    }

    /// Recursively delete the group. Failures are logged, not returned.
    pub async fn release(&self, executor: &dyn Executor) {
        if self.controllers.is_empty() {
            return;
        }
        let spec = self.group_spec();
        if let Err(e) = executor.run("cgdelete", &["-r", "-g", &spec]).await {
            warn!(cgroup = %self.name, error = %e, "failed to delete cgroup");
        }
    }

    /// Argument prefix that runs a command inside the group.
    pub fn exec_prefix(&self) -> Vec<String> {
        vec!["cgexec".to_string(), "-g".to_string(), self.group_spec()]
    }
}
