use std::collections::HashSet;
use std::io::Write as _;

use chrono::{DateTime, Local, Utc};
use taskstream::{DisplayStep, EventKind, SessionState, TaskSnapshot, TaskView};

type StepKey = (EventKind, String, Option<u64>, DateTime<Utc>);

fn label(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Think => "think",
        EventKind::Tool => "tool",
        EventKind::Act => "act",
        EventKind::Log => "log",
        EventKind::Run => "run",
        EventKind::Message => "message",
        EventKind::Planning => "plan",
        EventKind::Status => "status",
        EventKind::Step => "step",
        EventKind::Result => "result",
        EventKind::Complete => "done",
        EventKind::Error => "error",
        EventKind::Warning => "warn",
        EventKind::Ping => "",
    }
}

pub fn format_step(step: &DisplayStep) -> String {
    let time = step.timestamp.with_timezone(&Local).format("%H:%M:%S");
    let number = step
        .step_number
        .map(|n| format!("#{n} "))
        .unwrap_or_default();
    format!("{time} {number}[{}] {}", label(step.kind), step.content)
}

/// Prints each projected step once, as it first appears.
///
/// Steps that are placed before already printed ones are printed when they
/// arrive; the stored view keeps the authoritative order.
#[derive(Default)]
pub struct StepPrinter {
    printed: HashSet<StepKey>,
    dots: usize,
}

impl StepPrinter {
    pub fn render(&mut self, view: &TaskView) {
        let mut out = std::io::stdout().lock();
        for step in &view.steps {
            let key = (
                step.kind,
                step.content.clone(),
                step.step_number,
                step.timestamp,
            );
            if !self.printed.insert(key) {
                continue;
            }
            if step.is_ping() {
                let _ = write!(out, ".");
                self.dots += 1;
                continue;
            }
            if self.dots > 0 {
                let _ = writeln!(out);
                self.dots = 0;
            }
            let _ = writeln!(out, "{}", format_step(step));
        }
        let _ = out.flush();
    }

    pub fn state(&mut self, state: SessionState) {
        if self.dots > 0 {
            println!();
            self.dots = 0;
        }
        match state {
            SessionState::Retrying(attempt) => eprintln!("-- reconnecting (attempt {attempt})"),
            SessionState::Exhausted => eprintln!("-- connection lost"),
            SessionState::Live | SessionState::Connecting => eprintln!("-- {state}"),
            SessionState::Idle | SessionState::Closed => {}
        }
    }

    pub fn summary(&mut self, view: &TaskView) {
        self.state(SessionState::Closed);
        if let Some(result) = view.result.as_ref().filter(|r| r.visible) {
            println!("\n{}: {}", label(result.kind), result.content);
        }
        if let Some(status) = &view.status {
            println!("status: {status}");
        }
        if let Some(usage) = view.token_usage.filter(|usage| !usage.is_empty()) {
            println!(
                "tokens: input {}, completion {}, total {}",
                usage.input, usage.completion, usage.total
            );
        }
        if let Some(seconds) = view.execution_time {
            println!("time: {seconds:.2}s");
        }
        if let Some(failure) = &view.failure {
            eprintln!("{failure}");
        }
    }
}

pub fn print_snapshot(snapshot: &TaskSnapshot) {
    println!("task {} ({})", snapshot.id, snapshot.status);
    if let Some(prompt) = &snapshot.prompt {
        println!("prompt: {prompt}");
    }
    for step in &snapshot.steps {
        let number = step.step.map(|n| format!("#{n} ")).unwrap_or_default();
        println!(
            "{number}[{}] {}",
            step.kind,
            step.result.as_deref().unwrap_or_default()
        );
    }
}

pub fn task_line(snapshot: &TaskSnapshot) -> String {
    let prompt = snapshot.prompt.as_deref().unwrap_or_default();
    let mut short: String = prompt.chars().take(60).collect();
    if prompt.chars().count() > 60 {
        short.push_str("...");
    }
    format!(
        "{}  {:<10}  {}  {}",
        snapshot.id,
        snapshot.status.to_string(),
        snapshot.created_at.as_deref().unwrap_or("-"),
        short
    )
}
