//! Argument vectors of the provisioning tool functions.

use std::path::Path;

use bbcore::{GroupId, JobId, UserId};

pub const POOLS: &str = "pools";
pub const SHOW_SESSIONS: &str = "show_sessions";
pub const SHOW_INSTANCES: &str = "show_instances";
pub const SHOW_CONFIGURATIONS: &str = "show_configurations";

fn path(path: &Path) -> String {
    path.display().to_string()
}

pub fn query(function: &str) -> Vec<String> {
    vec![function.to_string()]
}

pub fn setup(
    job_id: JobId,
    user_id: UserId,
    group_id: GroupId,
    pool: &str,
    size: u64,
    script: &Path,
    host_file: Option<&Path>,
) -> Vec<String> {
    let mut args = vec![
        "setup".to_string(),
        "--token".to_string(),
        job_id.to_string(),
        "--user".to_string(),
        user_id.to_string(),
        "--groupid".to_string(),
        group_id.to_string(),
        "--capacity".to_string(),
        format!("{pool}:{size}"),
        "--job".to_string(),
        path(script),
    ];
    if let Some(host_file) = host_file {
        args.push("--nodehostnamefile".to_string());
        args.push(path(host_file));
    }
    args
}

pub fn real_size(job_id: JobId) -> Vec<String> {
    vec![
        "real_size".to_string(),
        "--token".to_string(),
        job_id.to_string(),
    ]
}

fn token_and_job(function: &str, job_id: JobId, script: &Path) -> Vec<String> {
    vec![
        function.to_string(),
        "--token".to_string(),
        job_id.to_string(),
        "--job".to_string(),
        path(script),
    ]
}

pub fn data_in(job_id: JobId, script: &Path) -> Vec<String> {
    token_and_job("data_in", job_id, script)
}

pub fn pre_run(
    job_id: JobId,
    script: &Path,
    host_file: Option<&Path>,
    exec_file: Option<&Path>,
) -> Vec<String> {
    let mut args = token_and_job("pre_run", job_id, script);
    if let Some(host_file) = host_file {
        args.push("--nodehostnamefile".to_string());
        args.push(path(host_file));
    }
    if let Some(exec_file) = exec_file {
        args.push("--jobexecutionnodefile".to_string());
        args.push(path(exec_file));
    }
    args
}

pub fn post_run(job_id: JobId, script: &Path) -> Vec<String> {
    token_and_job("post_run", job_id, script)
}

pub fn data_out(job_id: JobId, script: &Path) -> Vec<String> {
    token_and_job("data_out", job_id, script)
}

pub fn teardown(job_id: JobId, script: &Path, hurry: bool) -> Vec<String> {
    let mut args = token_and_job("teardown", job_id, script);
    if hurry {
        args.push("--hurry".to_string());
    }
    args
}

pub fn create_persistent(
    name: &str,
    user_id: UserId,
    pool: &str,
    size: u64,
    access: Option<&str>,
    buffer_type: Option<&str>,
) -> Vec<String> {
    let mut args = vec![
        "create_persistent".to_string(),
        "-t".to_string(),
        name.to_string(),
        "-u".to_string(),
        user_id.to_string(),
        "-C".to_string(),
        format!("{pool}:{size}"),
    ];
    if let Some(access) = access {
        args.push("-a".to_string());
        args.push(access.to_string());
    }
    if let Some(buffer_type) = buffer_type {
        args.push("-T".to_string());
        args.push(buffer_type.to_string());
    }
    args
}

pub fn destroy_persistent(name: &str, script: &Path, hurry: bool) -> Vec<String> {
    let mut args = vec![
        "destroy_persistent".to_string(),
        "--token".to_string(),
        name.to_string(),
        "--job".to_string(),
        path(script),
    ];
    if hurry {
        args.push("--hurry".to_string());
    }
    args
}

/// Lets the tool check the directives of a job script.
pub fn job_process(script: &Path) -> Vec<String> {
    vec!["job_process".to_string(), "--job".to_string(), path(script)]
}
