mod commands;
mod layout;

pub(crate) use commands::{
    clean, ensure_tools, list_tools, print_plan, run_pipeline, run_stage, run_tasks,
};
pub(crate) use layout::Session;
