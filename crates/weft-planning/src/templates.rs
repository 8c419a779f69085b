//! Template plans written by `weft init`

use serde_json::json;
use weft_core::{Plan, Priority};

use crate::PlanBuilder;

/// A small diamond-shaped plan exercising two resource categories
pub fn example_plan() -> Plan {
    PlanBuilder::new("example")
        .with_id("example")
        .step("fetch-a", "Download the first input", "default")
        .step("fetch-b", "Download the second input", "default")
        .step("combine", "Merge both inputs", "default")
        .depends_on("fetch-a")
        .depends_on("fetch-b")
        .priority(Priority::High)
        .step("report", "Summarize the merged output", "default")
        .depends_on("combine")
        .input("note", json!("inputs are passed to the handler untouched"))
        .build()
}

/// One shell command per step, run through the `command` handler
pub fn command_plan() -> Plan {
    PlanBuilder::new("shell")
        .with_id("shell")
        .step("list", "List the working directory", "shell")
        .input("command", json!("ls"))
        .input("args", json!(["-la"]))
        .step("done", "Announce completion", "shell")
        .depends_on("list")
        .input("command", json!("echo"))
        .input("args", json!(["plan finished"]))
        .build()
}
