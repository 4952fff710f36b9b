use std::env;
use std::io::{self, BufRead, IsTerminal, Write};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

static VERBOSE: AtomicBool = AtomicBool::new(false);

fn use_color() -> bool {
    static USE_COLOR: OnceLock<bool> = OnceLock::new();
    *USE_COLOR.get_or_init(|| env::var_os("NO_COLOR").is_none())
}

fn is_tty() -> bool {
    static IS_TTY: OnceLock<bool> = OnceLock::new();
    *IS_TTY.get_or_init(|| io::stderr().is_terminal())
}

fn paint(code: &str, text: &str) -> String {
    if use_color() {
        format!("\u{1b}[{}m{}\u{1b}[0m", code, text)
    } else {
        text.to_string()
    }
}

fn dim(text: &str) -> String {
    paint("2", text)
}

fn bold(text: &str) -> String {
    paint("1", text)
}

fn green(text: &str) -> String {
    paint("32", text)
}

fn cyan(text: &str) -> String {
    paint("36", text)
}

fn yellow(text: &str) -> String {
    paint("33", text)
}

fn red(text: &str) -> String {
    paint("31", text)
}

pub fn set_verbose(enabled: bool) {
    VERBOSE.store(enabled, Ordering::Relaxed);
}

pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed) || env::var_os("NX_VERBOSE_LOGGING").is_some()
}

pub fn verbose(message: &str) {
    if is_verbose() {
        eprintln!("{}", dim(message));
    }
}

pub fn heading(command: &str, version: &str) {
    eprintln!("{}", dim(&format!("nxup {} v{}", command, version)));
    eprintln!();
}

pub fn step(message: &str) {
    if is_tty() {
        eprint!("\r\u{1b}[K{}\n", dim(message));
        let _ = io::stderr().flush();
    } else {
        eprintln!("{}", dim(message));
    }
}

pub fn info(message: &str) {
    println!("{}", message);
}

pub fn warn(message: &str) {
    eprintln!("{} {}", yellow("warn"), message);
}

pub fn error(message: &str) {
    eprintln!("{} {}", red("error"), message);
}

pub fn titled_error(title: &str, detail: &str) {
    eprintln!();
    eprintln!("{}", red(&bold(title)));
    for line in detail.lines() {
        eprintln!("  {}", line);
    }
    eprintln!();
}

pub fn package_update(name: &str, from: Option<&str>, to: &str) {
    let arrow = match from {
        Some(from) => format!("{} {} {}", dim(from), dim("->"), to),
        None => to.to_string(),
    };
    println!("{} {} {}", green("+"), name, arrow);
}

pub fn migration_started(name: &str, description: Option<&str>) {
    println!("{} {}", cyan("Running migration"), bold(name));
    if let Some(description) = description {
        println!("  {}", dim(description));
    }
}

pub fn migration_no_changes(name: &str) {
    println!("{} {}", dim("No changes were made by"), dim(name));
}

pub fn migration_succeeded(name: &str) {
    println!("{} {}", green("Successfully finished"), name);
}

pub fn file_change(kind: &str, path: &str) {
    let tag = match kind {
        "CREATE" => green(kind),
        "DELETE" => red(kind),
        _ => yellow(kind),
    };
    println!("{} {}", tag, path);
}

/// Blocking yes/no prompt on stdin. Empty input counts as yes.
pub fn confirm(question: &str) -> io::Result<bool> {
    eprint!("{} {} ", question, dim("(Y/n)"));
    io::stderr().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    let answer = answer.trim().to_ascii_lowercase();

    Ok(answer.is_empty() || answer == "y" || answer == "yes")
}
