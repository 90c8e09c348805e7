use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{prefix:.bold} {msg} [{elapsed_precise}] {bar:40.green/white} {pos:>6}/{len:6} {percent:>3}%",
    )
    .unwrap()
    .progress_chars("=>-")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:.bold} {spinner} {msg} [{elapsed_precise}]")
        .unwrap()
        .tick_chars("|/-\\ ")
}

pub fn bar(len: u64, prefix: &str, msg: &str) -> ProgressBar {
    let pb = ProgressBar::with_draw_target(Some(len), ProgressDrawTarget::stderr_with_hz(10));
    pb.set_style(bar_style());
    pb.set_prefix(prefix.to_string());
    pb.set_message(msg.to_string());
    pb
}

pub fn spinner(prefix: &str, msg: &str) -> ProgressBar {
    let pb = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr_with_hz(10));
    pb.set_style(spinner_style());
    pb.set_prefix(prefix.to_string());
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
