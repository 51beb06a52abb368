//! 工具注册表
//!
//! 所有工具实现 Tool trait（名称、描述、参数声明、返回说明、异步执行），按名注册；
//! 每个 Agent 持有一组授权的工具名。调用前按参数声明校验：缺少必填参数报
//! MissingRequiredParameter，未声明的多余参数被丢弃。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::HiveError;

/// 参数声明
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub description: String,
    /// 没有默认值的参数为必填
    pub required: bool,
}

impl ParamSpec {
    pub fn required(name: &str, type_name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
            description: description.to_string(),
            required: true,
        }
    }

    pub fn optional(name: &str, type_name: &str, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, type_name, description)
        }
    }
}

/// 工具 trait
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（模型回复中的 action 字段）
    fn name(&self) -> &str;

    /// 工具描述（供模型理解功能）
    fn description(&self) -> &str;

    fn parameters(&self) -> Vec<ParamSpec> {
        Vec::new()
    }

    fn return_type(&self) -> &str {
        "string"
    }

    fn return_description(&self) -> &str {
        ""
    }

    /// 执行工具；args 已经过参数校验
    async fn execute(&self, args: Value) -> Result<String, String>;
}

type SyncFn = dyn Fn(&Value) -> Result<String, String> + Send + Sync;

/// 同步函数适配为工具
pub struct FnTool {
    name: String,
    description: String,
    params: Vec<ParamSpec>,
    f: Box<SyncFn>,
}

impl FnTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        params: Vec<ParamSpec>,
        f: impl Fn(&Value) -> Result<String, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params,
            f: Box::new(f),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        self.params.clone()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        (self.f)(&args)
    }
}

/// 校验参数：缺失必填项报错，丢弃未声明的键
pub fn prepare_args(tool: &dyn Tool, args: Value) -> Result<Value, HiveError> {
    let params = tool.parameters();
    let mut given = match args {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let missing: Vec<String> = params
        .iter()
        .filter(|p| p.required && given.get(&p.name).map(Value::is_null).unwrap_or(true))
        .map(|p| p.name.clone())
        .collect();
    if !missing.is_empty() {
        return Err(HiveError::MissingRequiredParameter {
            tool: tool.name().to_string(),
            params: missing,
        });
    }
    let declared: BTreeSet<&str> = params.iter().map(|p| p.name.as_str()).collect();
    given.retain(|k, _| declared.contains(k.as_str()));
    Ok(Value::Object(given))
}

/// 工具注册表 + 每个 Agent 的授权集合
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, Arc<dyn Tool>>>,
    grants: RwLock<HashMap<String, BTreeSet<String>>>,
}

fn poisoned<T>(_: T) -> HiveError {
    HiveError::Backend("tool registry lock poisoned".to_string())
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；同名工具已存在时保留旧的并返回 false
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<bool, HiveError> {
        let mut tools = self.tools.write().map_err(poisoned)?;
        let name = tool.name().to_string();
        if tools.contains_key(&name) {
            return Ok(false);
        }
        tools.insert(name, tool);
        Ok(true)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().ok().and_then(|t| t.get(name).cloned())
    }

    /// 授权工具给 Agent；重复授权报 DuplicateTool
    pub fn grant(&self, agent: &str, tool_name: &str) -> Result<(), HiveError> {
        if self.get(tool_name).is_none() {
            return Err(HiveError::ToolNotFound(tool_name.to_string()));
        }
        let mut grants = self.grants.write().map_err(poisoned)?;
        let set = grants.entry(agent.to_string()).or_default();
        if !set.insert(tool_name.to_string()) {
            return Err(HiveError::DuplicateTool {
                agent: agent.to_string(),
                tool: tool_name.to_string(),
            });
        }
        Ok(())
    }

    pub fn revoke(&self, agent: &str, tool_name: &str) -> bool {
        self.grants
            .write()
            .map(|mut g| g.get_mut(agent).map(|s| s.remove(tool_name)).unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn is_granted(&self, agent: &str, tool_name: &str) -> bool {
        self.grants
            .read()
            .map(|g| g.get(agent).map(|s| s.contains(tool_name)).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Agent 可用工具的快照
    pub fn tools_for(&self, agent: &str) -> Vec<Arc<dyn Tool>> {
        let names: Vec<String> = self
            .grants
            .read()
            .map(|g| g.get(agent).map(|s| s.iter().cloned().collect()).unwrap_or_default())
            .unwrap_or_default();
        names.iter().filter_map(|n| self.get(n)).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut g) = self.grants.write() {
            g.clear();
        }
        if let Ok(mut t) = self.tools.write() {
            t.clear();
        }
    }

    /// Agent 工具清单（JSON），拼入 system prompt
    pub fn to_schema_json(&self, agent: &str) -> String {
        let tools: Vec<Value> = self
            .tools_for(agent)
            .iter()
            .map(|tool| {
                let params: Map<String, Value> = tool
                    .parameters()
                    .into_iter()
                    .map(|p| {
                        let name = p.name.clone();
                        (name, serde_json::to_value(&p).unwrap_or(Value::Null))
                    })
                    .collect();
                serde_json::json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "parameters": params,
                    "return_type": tool.return_type(),
                    "return_description": tool.return_description(),
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}
