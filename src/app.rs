use crate::cli::{Cli, Commands};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::job::{JobStatus, RunStatus, ToolSelection};
use crate::ledger;
use anyhow::{bail, Context, Result};
use colored::Colorize;
use std::path::Path;

pub async fn run(cli: Cli) -> Result<()> {
    let config = EngineConfig::load(cli.config.as_deref())?;
    let engine = Engine::bootstrap(config).await?;

    match cli.command {
        Commands::Run {
            targets,
            tools,
            profile,
            params,
            extra,
            name,
            timeout,
        } => {
            let base = match &profile {
                Some(id) => engine.catalog().expand_profile(id)?,
                None => Vec::new(),
            };
            let selections = build_selections(base, &tools, &params, &extra, timeout)?;
            run_job(&engine, &name, targets, selections).await
        }
        Commands::Status { job_id } => show_status(&engine, &job_id).await,
        Commands::Cancel { job_id } => cancel(&engine, &job_id).await,
        Commands::Jobs => list_jobs(&engine).await,
        Commands::Tools => {
            list_tools(&engine);
            Ok(())
        }
        Commands::Profiles => {
            list_profiles(&engine);
            Ok(())
        }
    }
}

/// Merges profile-expanded selections with the repeatable CLI flags:
/// `--tool` ids not already covered by the profile are appended, then
/// `--set tool.param=value` and `--extra tool=args` attach to the
/// matching selection and reject ids that were not selected.
fn build_selections(
    base: Vec<ToolSelection>,
    tools: &[String],
    params: &[String],
    extra: &[String],
    timeout: Option<u64>,
) -> Result<Vec<ToolSelection>> {
    let mut selections = base;
    for id in tools {
        if selections.iter().any(|s| &s.tool_id == id) {
            continue;
        }
        selections.push(ToolSelection::new(id.clone()));
    }
    if let Some(timeout) = timeout {
        for selection in &mut selections {
            selection.timeout_secs = Some(timeout);
        }
    }

    for spec in params {
        let (key, value) = spec
            .split_once('=')
            .with_context(|| format!("--set '{spec}' is not TOOL.PARAM=VALUE"))?;
        let (tool_id, param) = key
            .split_once('.')
            .with_context(|| format!("--set '{spec}' is not TOOL.PARAM=VALUE"))?;
        let selection = selections
            .iter_mut()
            .find(|s| s.tool_id == tool_id)
            .with_context(|| format!("--set targets '{tool_id}', which is not selected"))?;
        selection
            .params
            .insert(param.to_string(), value.to_string());
    }

    for spec in extra {
        let (tool_id, args) = spec
            .split_once('=')
            .with_context(|| format!("--extra '{spec}' is not TOOL=ARGS"))?;
        let selection = selections
            .iter_mut()
            .find(|s| s.tool_id == tool_id)
            .with_context(|| format!("--extra targets '{tool_id}', which is not selected"))?;
        selection.extra_args = args.to_string();
    }

    Ok(selections)
}

async fn run_job(
    engine: &Engine,
    name: &str,
    targets: Vec<String>,
    selections: Vec<ToolSelection>,
) -> Result<()> {
    for selection in &selections {
        if engine.catalog().get(&selection.tool_id).is_none() {
            bail!("tool '{}' is not in the catalog", selection.tool_id);
        }
    }

    let job_id = engine.create_job(name, targets, selections).await?;
    println!("{} {}", "job".bold(), job_id.cyan());

    let status = engine.execute(&job_id).await?;
    println!();
    print_job(engine, &job_id).await?;
    if status == JobStatus::Completed {
        Ok(())
    } else {
        bail!("job {job_id} finished with status {status}")
    }
}

async fn show_status(engine: &Engine, job_id: &str) -> Result<()> {
    print_job(engine, job_id).await
}

async fn print_job(engine: &Engine, job_id: &str) -> Result<()> {
    let row = engine
        .store()
        .get(job_id)
        .await?
        .with_context(|| format!("no job with id {job_id}"))?;

    println!("{} {} ({})", "job".bold(), row.id.cyan(), row.name);
    println!(
        "  status {}  progress {}%",
        paint_job_status(row.status),
        row.overall_progress
    );
    println!("  created {}", row.created_at);
    if let Some(started) = &row.started_at {
        println!("  started {}", started);
    }
    if let Some(ended) = &row.ended_at {
        println!("  ended   {}", ended);
    }
    if let Some(message) = &row.error_message {
        println!("  error   {}", message.red());
    }
    if let Some(archive) = &row.archive_path {
        println!("  archive {}", archive);
    }

    // Per-tool detail lives in the ledger, not the row.
    let Some(summary) = ledger::load(Path::new(&row.results_path))? else {
        return Ok(());
    };
    println!();
    for (key, record) in &summary.tool_progress {
        println!("  {:<10} {}", paint_run_status(record.status), key);
        if let Some(output) = &record.output_file {
            println!("             {}", output.dimmed());
        }
        if let Some(message) = &record.error_message {
            println!("             {}", message.red());
        }
    }
    Ok(())
}

async fn cancel(engine: &Engine, job_id: &str) -> Result<()> {
    if engine.store().request_cancel(job_id).await? {
        println!("cancellation requested for job {}", job_id.cyan());
        return Ok(());
    }
    match engine.store().get(job_id).await? {
        Some(row) => bail!(
            "job {job_id} is {} and can no longer be cancelled",
            row.status
        ),
        None => bail!("no job with id {job_id}"),
    }
}

async fn list_jobs(engine: &Engine) -> Result<()> {
    let rows = engine.store().list().await?;
    if rows.is_empty() {
        println!("no jobs yet");
        return Ok(());
    }
    for row in rows {
        println!(
            "{}  {:<22} {:>4}%  {}  {}",
            row.id.cyan(),
            paint_job_status(row.status),
            row.overall_progress,
            row.created_at,
            row.name
        );
    }
    Ok(())
}

fn list_tools(engine: &Engine) {
    for tool in engine.catalog().iter() {
        let mut flags = Vec::new();
        if tool.needs_shell {
            flags.push("shell");
        }
        if tool.dangerous {
            flags.push("dangerous");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", ")).yellow().to_string()
        };
        println!("{:<14} {}{}", tool.id.cyan(), tool.name, flags);
        if !tool.description.is_empty() {
            println!("               {}", tool.description.dimmed());
        }
    }
}

fn list_profiles(engine: &Engine) {
    let mut any = false;
    for profile in engine.catalog().profiles() {
        any = true;
        println!("{:<14} {}", profile.id.cyan(), profile.description);
        println!("               tools: {}", profile.tools.join(", ").dimmed());
    }
    if !any {
        println!("no profiles in the catalog");
    }
}

fn paint_job_status(status: JobStatus) -> String {
    let s = status.as_str();
    match status {
        JobStatus::Completed => s.green().to_string(),
        JobStatus::CompletedWithErrors => s.yellow().to_string(),
        JobStatus::Error => s.red().to_string(),
        JobStatus::Cancelled | JobStatus::RequestCancel => s.yellow().to_string(),
        JobStatus::Running | JobStatus::Initializing => s.cyan().to_string(),
        JobStatus::Pending => s.dimmed().to_string(),
    }
}

fn paint_run_status(status: RunStatus) -> String {
    let s = status.as_str();
    match status {
        RunStatus::Completed => s.green().to_string(),
        RunStatus::Error | RunStatus::Timeout => s.red().to_string(),
        RunStatus::Skipped => s.yellow().to_string(),
        RunStatus::Running => s.cyan().to_string(),
        RunStatus::Pending => s.dimmed().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn selections_pick_up_overrides() {
        let tools = vec!["nmap_quick".to_string(), "httpx".to_string()];
        let params = vec!["nmap_quick.min_rate=2000".to_string()];
        let extra = vec!["httpx=-rate-limit 10".to_string()];

        let selections = build_selections(Vec::new(), &tools, &params, &extra, Some(120)).unwrap();
        assert_eq!(selections.len(), 2);
        assert_eq!(selections[0].tool_id, "nmap_quick");
        assert_eq!(selections[0].params["min_rate"], "2000");
        assert_eq!(selections[0].timeout_secs, Some(120));
        assert_eq!(selections[1].extra_args, "-rate-limit 10");
    }

    #[test]
    fn overrides_for_unselected_tools_are_rejected() {
        let tools = vec!["httpx".to_string()];
        let err = build_selections(Vec::new(), &tools, &["nmap.min_rate=1".to_string()], &[], None)
            .unwrap_err();
        assert!(err.to_string().contains("not selected"));

        let err = build_selections(Vec::new(), &tools, &["broken-spec".to_string()], &[], None)
            .unwrap_err();
        assert!(err.to_string().contains("TOOL.PARAM=VALUE"));
    }

    #[test]
    fn empty_param_value_is_preserved() {
        // `--set tool.password=` must carry an explicit empty string
        let tools = vec!["login_brute".to_string()];
        let selections = build_selections(
            Vec::new(),
            &tools,
            &["login_brute.password=".to_string()],
            &[],
            None,
        )
        .unwrap();
        assert_eq!(selections[0].params["password"], "");
    }

    #[test]
    fn profile_selections_merge_with_tool_flags() {
        let mut from_profile = ToolSelection::new("subfinder");
        from_profile
            .params
            .insert("all_sources".to_string(), "true".to_string());

        // a --tool repeating a profile tool does not duplicate it, and
        // --set still reaches the profile-provided selection
        let tools = vec!["subfinder".to_string(), "httpx".to_string()];
        let params = vec!["subfinder.all_sources=false".to_string()];
        let selections =
            build_selections(vec![from_profile], &tools, &params, &[], None).unwrap();

        assert_eq!(selections.len(), 2);
        assert_eq!(selections[0].tool_id, "subfinder");
        assert_eq!(selections[0].params["all_sources"], "false");
        assert_eq!(selections[1].tool_id, "httpx");
    }
}
