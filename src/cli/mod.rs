//! CLI command handling
//!
//! Builds a package from the command line, drives a [`TestController`] and
//! reports through the console observer.

mod console;

pub use console::ConsoleObserver;

use colored::Colorize;
use std::sync::Arc;

use crate::commands::{Commands, PackageArgs};
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::controller::TestController;
use crate::filter::{CategoryExpression, TestFilter};
use crate::model::{settings, Test, TestPackage, TestResult};
use crate::services::Services;

/// Dispatch a CLI command, returning the process exit code
pub async fn dispatch(command: Commands) -> Result<i32> {
    match command {
        Commands::Agent { .. } => {
            // Agent mode is handled in main
            Err(Error::Internal("Agent command must be handled in main".to_string()))
        }

        Commands::Run {
            package,
            filter,
            watch,
        } => {
            let filter = parse_filter(filter.as_deref())?;
            let mut config = Config::load()?;
            apply_overrides(&mut config, &package);
            if watch {
                config.watch.enabled = true;
                config.watch.rerun_on_change = true;
            }

            let controller = open(config, &package).await?;

            if watch {
                return watch_until_interrupted(&controller, filter).await;
            }

            let outcome = controller.run(filter).await;
            controller.shutdown().await;
            Ok(exit_code(&outcome?))
        }

        Commands::List { package, filter } => {
            let filter = parse_filter(filter.as_deref())?;
            let mut config = Config::load()?;
            apply_overrides(&mut config, &package);

            let controller = open(config, &package).await?;
            if let Some(test) = controller.test().await {
                print_tree(&test, &filter, 0);
                println!(
                    "\n{} {} test cases",
                    "Total:".cyan(),
                    filter.count(&test)
                );
            }
            controller.shutdown().await;
            Ok(0)
        }
    }
}

fn parse_filter(text: Option<&str>) -> Result<TestFilter> {
    match text {
        Some(text) => CategoryExpression::parse(text),
        None => Ok(TestFilter::Empty),
    }
}

fn apply_overrides(config: &mut Config, args: &PackageArgs) {
    if let Some(isolation) = args.isolation {
        config.runner.isolation = isolation;
    }
    if args.no_shadow_copy {
        config.runner.shadow_copy = false;
    }
}

/// Package described by the command line
pub fn build_package(args: &PackageArgs) -> Result<TestPackage> {
    let mut package = TestPackage::new(args.assemblies.iter().cloned());
    if let Some(base) = &args.base {
        package = package.with_base_directory(base.clone());
    }
    if let Some(config_file) = &args.config_file {
        package = package.with_config_file(config_file.clone());
    }
    if let Some(test) = &args.test {
        package = package.with_test_name(test.clone());
    }
    for setting in &args.settings {
        let (key, value) = setting
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("Invalid setting '{}', expected KEY=VALUE", setting)))?;
        package = package.with_setting(key.trim(), value.trim());
    }
    if args.no_shadow_copy {
        package = package.with_setting(settings::SHADOW_COPY, false);
    }
    Ok(package)
}

/// Controller with the package loaded and console reporting attached
async fn open(config: Config, args: &PackageArgs) -> Result<Arc<TestController>> {
    let package = build_package(args)?;
    let services = Arc::new(Services::new(config)?);
    let controller = TestController::new(services);
    controller
        .events()
        .subscribe(Arc::new(ConsoleObserver::new(args.verbose)));

    let name = package.name();
    let test_name = package.test_name.clone();
    let loaded = match controller.load_project(&name, package).await {
        Ok(()) => controller.load_test(test_name.as_deref()).await,
        Err(e) => Err(e),
    };

    if let Err(e) = loaded {
        controller.shutdown().await;
        return Err(e);
    }
    Ok(controller)
}

async fn watch_until_interrupted(controller: &Arc<TestController>, filter: TestFilter) -> Result<i32> {
    controller.run_tests(filter).await?;
    println!("{}", "Watching for changes, press Ctrl+C to stop".dimmed());

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Cannot listen for Ctrl+C");
    }

    controller.cancel_run().await;
    controller.wait().await;
    let code = controller.last_result().await.as_ref().map(exit_code).unwrap_or(0);
    controller.shutdown().await;
    Ok(code)
}

fn exit_code(result: &TestResult) -> i32 {
    if result.is_failure() {
        1
    } else {
        0
    }
}

fn print_tree(test: &Test, filter: &TestFilter, depth: usize) {
    let indent = "  ".repeat(depth);
    if test.is_suite {
        if filter.count(test) == 0 {
            return;
        }
        println!("{}{}", indent, test.name.name.cyan());
        for child in &test.children {
            print_tree(child, filter, depth + 1);
        }
    } else if filter.pass(test) {
        if test.categories.is_empty() {
            println!("{}{}", indent, test.name.name);
        } else {
            let categories: Vec<&str> = test.categories.iter().map(String::as_str).collect();
            println!("{}{} {}", indent, test.name.name, format!("[{}]", categories.join(", ")).dimmed());
        }
    }
}
