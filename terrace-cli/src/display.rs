//! Terminal rendering of plans and apply reports

use std::collections::{BTreeMap, HashMap, HashSet};

use colored::{ColoredString, Colorize};

use terrace_core::effect::Effect;
use terrace_core::interpreter::{ApplyResult, StepOutcome};
use terrace_core::output::BoundOutput;
use terrace_core::plan::Plan;
use terrace_core::resource::{State, Value};
use terrace_core::schema::ReplacementPolicy;

fn symbol(effect: &Effect) -> ColoredString {
    match effect {
        Effect::Create(_) => "+".green().bold(),
        Effect::Update { .. } => "~".yellow().bold(),
        Effect::Replace {
            policy: ReplacementPolicy::CreateBeforeDestroy,
            ..
        } => "+/-".magenta().bold(),
        Effect::Replace { .. } => "-/+".magenta().bold(),
        Effect::Delete { .. } => "-".red().bold(),
        Effect::NoOp(_) => " ".normal(),
    }
}

pub fn format_effect(effect: &Effect) -> String {
    let verb = match effect {
        Effect::Create(_) => "Create",
        Effect::Update { .. } => "Update",
        Effect::Replace { .. } => "Replace",
        Effect::Delete { deposed: true, .. } => "Delete deposed",
        Effect::Delete { .. } => "Delete",
        Effect::NoOp(_) => "Keep",
    };
    format!("{} {}", verb, effect.id())
}

pub fn format_value(value: &Value) -> String {
    value.to_string()
}

/// Old value of a changed argument; sensitive arguments are never stored
fn previous_value(from: &State, key: &str) -> String {
    match from.attributes.get(key) {
        Some(value) => format_value(value),
        None if from.argument_hashes.contains_key(key) => "(sensitive)".to_string(),
        None => "(none)".to_string(),
    }
}

/// Keys sorted with `name` first
fn sorted_keys<'a>(keys: impl Iterator<Item = &'a String>) -> Vec<&'a String> {
    let mut keys: Vec<&String> = keys.filter(|k| !k.starts_with('_')).collect();
    keys.sort_by(|a, b| match (a.as_str(), b.as_str()) {
        ("name", _) => std::cmp::Ordering::Less,
        (_, "name") => std::cmp::Ordering::Greater,
        _ => a.cmp(b),
    });
    keys
}

fn print_details(effect: &Effect, attr_prefix: &str) {
    match effect {
        Effect::Create(r) => {
            for key in sorted_keys(r.attributes.keys()) {
                let value = format_value(&r.attributes[key]);
                if key == "name" {
                    println!("{}{}: {}", attr_prefix, key.bold(), value.white().bold());
                } else {
                    println!("{}{}: {}", attr_prefix, key, value.green());
                }
            }
        }
        Effect::Update {
            from,
            to,
            changed_attributes,
            ..
        }
        | Effect::Replace {
            from,
            to,
            changed_attributes,
            ..
        } => {
            if let Effect::Replace { policy, .. } = effect {
                let reason = if from.tainted {
                    "tainted".to_string()
                } else {
                    "immutable attribute changed".to_string()
                };
                println!(
                    "{}{}",
                    attr_prefix,
                    format!("# {} ({})", reason, policy).dimmed()
                );
            }
            for key in sorted_keys(changed_attributes.iter()) {
                let new_value = to
                    .attributes
                    .get(key)
                    .map(format_value)
                    .unwrap_or_else(|| "(removed)".to_string());
                println!(
                    "{}{}: {} → {}",
                    attr_prefix,
                    key,
                    previous_value(from, key).red(),
                    new_value.green()
                );
            }
        }
        Effect::Delete { id, from, deposed } => {
            let identifier = if *deposed {
                from.deposed.as_deref()
            } else {
                from.identifier.as_deref()
            };
            println!(
                "{}{}: {}",
                attr_prefix,
                "name".bold(),
                id.name.red().bold()
            );
            if let Some(identifier) = identifier {
                println!("{}identifier: {}", attr_prefix, identifier.red());
            }
        }
        Effect::NoOp(_) => {}
    }
}

/// Print the mutating steps of a plan as a dependency tree
pub fn print_plan(plan: &Plan) {
    let summary = plan.summary();
    if !summary.has_changes() {
        println!("{}", "No changes. Infrastructure is up-to-date.".green());
        return;
    }

    let steps = plan.steps();
    let mutating: Vec<usize> = (0..steps.len())
        .filter(|&i| steps[i].effect.is_mutating())
        .collect();
    let mutating_set: HashSet<usize> = mutating.iter().copied().collect();

    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut roots = Vec::new();
    for &idx in &mutating {
        let parents: Vec<usize> = steps[idx]
            .after
            .iter()
            .copied()
            .filter(|p| mutating_set.contains(p))
            .collect();
        if parents.is_empty() {
            roots.push(idx);
        }
        for parent in parents {
            dependents.entry(parent).or_default().push(idx);
        }
    }

    println!("{}", "Execution Plan:".cyan().bold());
    println!();

    let mut printed: HashSet<usize> = HashSet::new();

    fn print_tree(
        idx: usize,
        plan: &Plan,
        dependents: &HashMap<usize, Vec<usize>>,
        printed: &mut HashSet<usize>,
        depth: usize,
        is_last: bool,
        prefix: &str,
    ) {
        if !printed.insert(idx) {
            return;
        }
        let effect = &plan.steps()[idx].effect;

        let connector = if depth == 0 {
            String::new()
        } else if is_last {
            format!("{}└─ ", prefix)
        } else {
            format!("{}├─ ", prefix)
        };
        let continuation = if depth == 0 {
            "    ".to_string()
        } else if is_last {
            format!("{}   ", prefix)
        } else {
            format!("{}│  ", prefix)
        };

        println!(
            "  {}{} {}",
            connector,
            symbol(effect),
            effect.id().to_string().cyan().bold()
        );
        print_details(effect, &format!("  {}  ", continuation));

        let children: Vec<usize> = dependents
            .get(&idx)
            .map(|c| c.iter().copied().filter(|c| !printed.contains(c)).collect())
            .unwrap_or_default();
        for (i, child) in children.iter().enumerate() {
            print_tree(
                *child,
                plan,
                dependents,
                printed,
                depth + 1,
                i == children.len() - 1,
                &continuation,
            );
        }
    }

    for (i, root) in roots.iter().enumerate() {
        print_tree(
            *root,
            plan,
            &dependents,
            &mut printed,
            0,
            i == roots.len() - 1,
            "",
        );
    }

    println!();
    println!(
        "Plan: {} to add, {} to change, {} to replace, {} to destroy.",
        summary.create.to_string().green(),
        summary.update.to_string().yellow(),
        summary.replace.to_string().magenta(),
        summary.delete.to_string().red()
    );
}

/// Print each step's outcome, then a summary line
pub fn print_report(result: &ApplyResult, verb: &str) {
    for report in &result.steps {
        let label = format!("{} {}", capitalize(report.operation), report.id);
        match &report.outcome {
            StepOutcome::Succeeded { .. } => println!("  {} {}", "✓".green(), label),
            StepOutcome::Unchanged => {}
            StepOutcome::Failed(error) => {
                println!("  {} {} - {}", "✗".red(), label, error.cause);
                println!(
                    "      {}",
                    format!("{} error after {} attempt(s)", error.kind, error.attempts).dimmed()
                );
            }
            StepOutcome::Skipped(reason) => {
                println!("  {} {} - skipped ({})", "○".yellow(), label, reason)
            }
        }
    }

    println!();
    let succeeded = result.success_count();
    if result.is_success() {
        println!(
            "{}",
            format!("{} complete! {} changes applied.", verb, succeeded)
                .green()
                .bold()
        );
    } else {
        println!(
            "{}",
            format!(
                "{} failed. {} succeeded, {} failed, {} skipped.",
                verb,
                succeeded,
                result.failure_count(),
                result.skipped().count()
            )
            .red()
            .bold()
        );
    }
}

pub fn print_outputs(outputs: &BTreeMap<String, BoundOutput>) {
    if outputs.is_empty() {
        return;
    }
    println!();
    println!("{}", "Outputs:".cyan().bold());
    for (name, output) in outputs {
        println!("  {} = {}", name.bold(), output.display_value());
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use terrace_core::resource::{Resource, ResourceId};

    #[test]
    fn effects_are_labelled() {
        let create = Effect::Create(Resource::new("aws.iam.role", "role"));
        assert_eq!(format_effect(&create), "Create aws.iam.role.role");

        let delete = Effect::Delete {
            id: ResourceId::new("aws.s3.bucket", "bucket"),
            from: State::not_found(ResourceId::new("aws.s3.bucket", "bucket")),
            deposed: true,
        };
        assert_eq!(format_effect(&delete), "Delete deposed aws.s3.bucket.bucket");
    }

    #[test]
    fn sensitive_previous_values_are_masked() {
        let mut hashes = HashMap::new();
        hashes.insert("token".to_string(), "h".to_string());
        let from = State::existing(ResourceId::new("aws.lambda.function", "f"), HashMap::new())
            .with_argument_hashes(hashes);
        assert_eq!(previous_value(&from, "token"), "(sensitive)");
        assert_eq!(previous_value(&from, "timeout"), "(none)");
    }

    #[test]
    fn name_sorts_first() {
        let keys = ["runtime".to_string(), "name".to_string(), "arn".to_string()];
        let sorted: Vec<&str> = sorted_keys(keys.iter()).into_iter().map(|s| s.as_str()).collect();
        assert_eq!(sorted, vec!["name", "arn", "runtime"]);
    }

    #[test]
    fn capitalizes_operations() {
        assert_eq!(capitalize("delete (deposed)"), "Delete (deposed)");
        assert_eq!(capitalize(""), "");
    }
}
