//! FileCheck-style validation for textual kernel fixtures.
//!
//! Fixtures are ordinary kernel files whose `//` comments carry directives:
//!
//! ```text
//! // RUN: gpuopt --passes remove-barriers --print-ir
//! // CHECK-LABEL: .kernel sync
//! // CHECK: bar.sync 0;
//! // CHECK-NEXT: ret;
//! .kernel sync
//!     bar.sync 0;
//!     bar.sync 0;
//!     ret;
//! ```
//!
//! Every RUN line runs the pipeline on the kernel and the output is matched
//! against the full CHECK list. With `--level` the kernel is translated and
//! the target code is printed; otherwise `--passes` selects an
//! optimize-in-place run whose output is chosen by the `--print-*` flags.

use thiserror::Error;

use crate::arch::Architecture;
use crate::core::analyzer::Analyzer;
use crate::core::error::TranslateError;
use crate::ir::parser::{parse_kernel, ParseError};
use crate::optimizer::optimize;
use crate::passes::PassMask;
use crate::regalloc::Location;
use crate::translator::{OptimizationLevel, TranslationOptions, Translator};

/// A CHECK directive extracted from a fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckDirective {
    /// `CHECK: pattern`, matched on any later line.
    Check(String),
    /// `CHECK-LABEL: pattern`, starts a section.
    CheckLabel(String),
    /// `CHECK-NEXT: pattern`, matched on the line after the previous match.
    CheckNext(String),
    /// `CHECK-EMPTY`, the next line is blank.
    CheckEmpty,
    /// `COM: text`, ignored.
    Comment(String),
}

/// A RUN directive: the command name and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirective {
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Error, Debug)]
pub enum CheckError {
    #[error("fixture has no RUN directive")]
    NoRunDirective,

    #[error("bad RUN argument: {0}")]
    BadArgument(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Translate(#[from] TranslateError),

    #[error("{0}")]
    Mismatch(String),
}

/// Directives and kernel text of one fixture.
#[derive(Debug)]
pub struct TestSpec {
    pub run_directives: Vec<RunDirective>,
    pub check_directives: Vec<CheckDirective>,
    pub kernel_source: String,
}

impl TestSpec {
    pub fn parse(content: &str) -> Result<Self, CheckError> {
        let mut run_directives = Vec::new();
        let mut check_directives = Vec::new();
        let mut kernel_lines = Vec::new();

        for line in content.lines() {
            let Some(comment) = line.trim().strip_prefix("//") else {
                kernel_lines.push(line);
                continue;
            };
            let comment = comment.trim();

            if let Some(run) = comment.strip_prefix("RUN:") {
                let mut parts = run.split_whitespace().map(str::to_string);
                if let Some(command) = parts.next() {
                    run_directives.push(RunDirective { command, args: parts.collect() });
                }
            } else if let Some(pattern) = comment.strip_prefix("CHECK-LABEL:") {
                check_directives.push(CheckDirective::CheckLabel(pattern.trim().to_string()));
            } else if let Some(pattern) = comment.strip_prefix("CHECK-NEXT:") {
                check_directives.push(CheckDirective::CheckNext(pattern.trim().to_string()));
            } else if comment.starts_with("CHECK-EMPTY") {
                check_directives.push(CheckDirective::CheckEmpty);
            } else if let Some(pattern) = comment.strip_prefix("CHECK:") {
                check_directives.push(CheckDirective::Check(pattern.trim().to_string()));
            } else if let Some(text) = comment.strip_prefix("COM:") {
                check_directives.push(CheckDirective::Comment(text.trim().to_string()));
            }
        }

        if run_directives.is_empty() {
            return Err(CheckError::NoRunDirective);
        }
        Ok(TestSpec { run_directives, check_directives, kernel_source: kernel_lines.join("\n") })
    }
}

/// Pipeline settings decoded from a RUN line.
#[derive(Debug, Default)]
struct RunConfig {
    passes: PassMask,
    level: Option<OptimizationLevel>,
    target: Option<Architecture>,
    registers: Option<u32>,
    print_ir: bool,
    print_cfg: bool,
    print_intervals: bool,
}

impl RunConfig {
    fn from_args(args: &[String]) -> Result<Self, CheckError> {
        let mut config = RunConfig::default();
        let mut args = args.iter();
        while let Some(arg) = args.next() {
            let mut value = || {
                args.next()
                    .ok_or_else(|| CheckError::BadArgument(format!("`{arg}` needs a value")))
            };
            match arg.as_str() {
                "--passes" => {
                    config.passes = value()?
                        .parse()
                        .map_err(|e| CheckError::BadArgument(format!("{e}")))?;
                }
                "--level" => {
                    config.level = Some(
                        value()?
                            .parse()
                            .map_err(|e| CheckError::BadArgument(format!("{e}")))?,
                    );
                }
                "--target" => {
                    config.target = Some(value()?.parse().map_err(CheckError::BadArgument)?);
                }
                "--registers" => {
                    let raw = value()?;
                    config.registers = Some(
                        raw.parse()
                            .map_err(|_| CheckError::BadArgument(format!("bad register count `{raw}`")))?,
                    );
                }
                "--print-ir" => config.print_ir = true,
                "--print-cfg" => config.print_cfg = true,
                "--print-intervals" => config.print_intervals = true,
                "%s" => {}
                other => return Err(CheckError::BadArgument(format!("unknown argument `{other}`"))),
            }
        }
        Ok(config)
    }
}

/// Runs fixtures and validates their output.
pub struct TestRunner {
    verbose: bool,
}

impl TestRunner {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    pub fn run_test(&self, spec: &TestSpec) -> Result<(), CheckError> {
        for run in &spec.run_directives {
            let output = self.execute(&spec.kernel_source, run)?;
            if self.verbose {
                println!("{output}");
            }
            self.validate_output(&output, &spec.check_directives)?;
        }
        Ok(())
    }

    /// Output of one RUN line.
    pub fn execute(&self, source: &str, run: &RunDirective) -> Result<String, CheckError> {
        let config = RunConfig::from_args(&run.args)?;
        let kernel = parse_kernel(source)?;
        let options = TranslationOptions {
            passes: config.passes,
            register_count: config.registers,
            cfg: config.print_cfg,
            ..Default::default()
        };
        let mut output = Vec::new();

        if let Some(level) = config.level {
            let target = config.target.unwrap_or(kernel.arch());
            let translated = Translator::new(kernel.arch(), target, level).translate_with(kernel, &options)?;
            let code = translated.code().map_err(TranslateError::from)?;
            output.push(code.trim_end().to_string());
            if let Some(dot) = translated.cfg() {
                output.push(dot.trim_end().to_string());
            }
            return Ok(output.join("\n"));
        }

        let optimized = optimize(kernel, &options)?;
        if config.print_ir || !(config.print_cfg || config.print_intervals) {
            output.push(optimized.kernel.to_string().trim_end().to_string());
        }
        if config.print_intervals {
            let arena = bumpalo::Bump::new();
            let liveness = Analyzer::new(&arena).analyze(&optimized.kernel);
            output.push(format!("Intervals for {}", optimized.kernel.name()));
            for interval in liveness.intervals {
                let location = match optimized.allocation.location(interval.vreg) {
                    Some(Location::Register(reg)) => reg.to_string(),
                    Some(Location::Spilled { slot }) => format!("spill {slot}"),
                    None => "-".to_string(),
                };
                output.push(format!(
                    "{}: [{}, {}] -> {}",
                    interval.vreg, interval.start, interval.end, location
                ));
            }
            output.push("End Intervals".to_string());
        }
        if let Some(dot) = optimized.cfg {
            output.push(dot.trim_end().to_string());
        }
        Ok(output.join("\n"))
    }

    /// Match `output` against the CHECK directives in order.
    pub fn validate_output(&self, output: &str, directives: &[CheckDirective]) -> Result<(), CheckError> {
        let lines: Vec<&str> = output.lines().collect();
        let mut next = 0;

        for directive in directives {
            match directive {
                CheckDirective::Comment(_) => {}

                CheckDirective::Check(pattern) | CheckDirective::CheckLabel(pattern) => {
                    let found = lines.iter().skip(next).position(|line| line.contains(pattern.as_str()));
                    match found {
                        Some(offset) => {
                            next += offset + 1;
                            log::trace!("`{}` matched line {}", pattern, next - 1);
                        }
                        None => {
                            return Err(CheckError::Mismatch(format!("pattern `{pattern}` not found")));
                        }
                    }
                }

                CheckDirective::CheckNext(pattern) => {
                    let Some(line) = lines.get(next) else {
                        return Err(CheckError::Mismatch(format!(
                            "CHECK-NEXT: no more lines, expected `{pattern}`"
                        )));
                    };
                    if !line.contains(pattern.as_str()) {
                        return Err(CheckError::Mismatch(format!(
                            "CHECK-NEXT: expected `{pattern}` but got `{line}`"
                        )));
                    }
                    next += 1;
                }

                CheckDirective::CheckEmpty => {
                    let Some(line) = lines.get(next) else {
                        return Err(CheckError::Mismatch("CHECK-EMPTY: no more lines".to_string()));
                    };
                    if !line.trim().is_empty() {
                        return Err(CheckError::Mismatch(format!(
                            "CHECK-EMPTY: expected an empty line but got `{line}`"
                        )));
                    }
                    next += 1;
                }
            }
        }
        Ok(())
    }
}
