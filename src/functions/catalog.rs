//! Static catalog of callable functions.
//!
//! The catalog maps each function name to its description and parameter
//! schema. It is also the allow-list: a name missing here is rejected by
//! the executor before argument validation.

use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Definition of one callable function.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub description: &'static str,
    /// JSON Schema for the arguments: typed properties, required keys,
    /// enums for closed sets.
    pub parameters: Value,
}

/// Static table of callable functions.
#[derive(Debug, Clone)]
pub struct FunctionCatalog {
    entries: BTreeMap<&'static str, FunctionDef>,
}

impl FunctionCatalog {
    /// Build the full catalog.
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();

        entries.insert(
            "launch_application",
            FunctionDef {
                description: "Launch a whitelisted desktop application by short name",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "name": {
                            "type": "string",
                            "description": "Application short name, e.g. 'chrome' or 'notepad'"
                        }
                    },
                    "required": ["name"]
                }),
            },
        );

        entries.insert(
            "open_file",
            FunctionDef {
                description: "Open a file with its default application",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "Path to the file" }
                    },
                    "required": ["path"]
                }),
            },
        );

        entries.insert(
            "open_url",
            FunctionDef {
                description: "Open an http(s) URL in the default browser",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "url": { "type": "string", "description": "URL to open" }
                    },
                    "required": ["url"]
                }),
            },
        );

        entries.insert(
            "run_command",
            FunctionDef {
                description: "Run a read-only shell query and return its output",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "command": {
                            "type": "string",
                            "description": "Read-only command, e.g. 'Get-Process' or 'Get-Date'"
                        }
                    },
                    "required": ["command"]
                }),
            },
        );

        entries.insert(
            "get_system_info",
            FunctionDef {
                description: "Query host system state (OS, architecture, CPU count)",
                parameters: json!({
                    "type": "object",
                    "properties": {}
                }),
            },
        );

        entries.insert(
            "get_time_date",
            FunctionDef {
                description: "Get the current time and date",
                parameters: json!({
                    "type": "object",
                    "properties": {}
                }),
            },
        );

        entries.insert(
            "list_files",
            FunctionDef {
                description: "List directory entries",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "Directory to list" }
                    },
                    "required": ["path"]
                }),
            },
        );

        entries.insert(
            "create_file",
            FunctionDef {
                description: "Create a text file with the given content",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "Destination path" },
                        "content": { "type": "string", "description": "File content" }
                    },
                    "required": ["path", "content"]
                }),
            },
        );

        entries.insert(
            "read_file",
            FunctionDef {
                description: "Read a text file (output truncated to 1000 bytes)",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "File to read" }
                    },
                    "required": ["path"]
                }),
            },
        );

        entries.insert(
            "delete_file",
            FunctionDef {
                description: "Delete a file (requires user confirmation)",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "File to delete" }
                    },
                    "required": ["path"]
                }),
            },
        );

        entries.insert(
            "move_file",
            FunctionDef {
                description: "Move or rename a file",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "source": { "type": "string", "description": "Current path" },
                        "destination": { "type": "string", "description": "New path" }
                    },
                    "required": ["source", "destination"]
                }),
            },
        );

        entries.insert(
            "search_files",
            FunctionDef {
                description: "Search a directory tree for file names containing a pattern",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "directory": { "type": "string", "description": "Root directory" },
                        "pattern": { "type": "string", "description": "Substring to match" }
                    },
                    "required": ["directory", "pattern"]
                }),
            },
        );

        entries.insert(
            "manage_window",
            FunctionDef {
                description: "Minimize, maximize, close, or focus a window by title",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "title": { "type": "string", "description": "Window title substring" },
                        "action": {
                            "type": "string",
                            "enum": ["minimize", "maximize", "close", "focus"]
                        }
                    },
                    "required": ["title", "action"]
                }),
            },
        );

        entries.insert(
            "set_volume",
            FunctionDef {
                description: "Set system output volume (0-100)",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "level": {
                            "type": "integer",
                            "description": "Target volume percentage"
                        }
                    },
                    "required": ["level"]
                }),
            },
        );

        Self { entries }
    }

    /// Look up a function definition.
    pub fn get(&self, name: &str) -> Option<&FunctionDef> {
        self.entries.get(name)
    }

    /// Whether the catalog contains the name.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// All function names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }

    /// Export the catalog in the form both backends declare to their
    /// providers: `{name, description, parameters}` per function, sorted
    /// by name.
    pub fn schemas_for_api(&self) -> Vec<Value> {
        self.entries
            .iter()
            .map(|(name, def)| {
                json!({
                    "name": name,
                    "description": def.description,
                    "parameters": def.parameters,
                })
            })
            .collect()
    }
}

impl Default for FunctionCatalog {
    fn default() -> Self {
        Self::new()
    }
}
