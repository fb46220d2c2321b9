use std::hint::black_box;

use funcstack::ReportOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[inline(never)]
fn func1(options: ReportOptions) {
    funcstack::print_backtrace_with(options);
    black_box(());
}

#[inline(never)]
fn func2(options: ReportOptions) {
    func1(options);
    black_box(());
}

fn parse_args() -> Result<ReportOptions, String> {
    let mut options = ReportOptions::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--offsets" => options = options.show_offsets(true),
            "--width" => {
                let width = args.next().ok_or("--width needs a value")?;
                let width = width
                    .parse()
                    .map_err(|err| format!("bad --width {}: {}", width, err))?;
                options = options.name_width(width);
            }
            other => return Err(format!("unknown argument {}", other)),
        }
    }
    Ok(options)
}

fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::WARN.into())
        .from_env_lossy();
    tracing_subscriber::Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let options = match parse_args() {
        Ok(options) => options,
        Err(err) => {
            eprintln!("{}", err);
            eprintln!(
                "Usage: {} [--offsets] [--width N]",
                std::env::args().next().unwrap_or_default()
            );
            std::process::exit(1);
        }
    };

    func2(options);
}
