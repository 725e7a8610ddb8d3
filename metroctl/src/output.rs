//! Table rendering for list commands.

use colored::Colorize;

use crate::client::{InstanceSummary, MetricSummary, PluginSummary, TaskSummary};

pub fn plugin_table(plugins: &[PluginSummary]) {
    if plugins.is_empty() {
        println!("No plugins loaded");
        return;
    }
    println!(
        "{:<20} {:<8} {:<12} {:<8} {:<8}",
        "NAME".bold(),
        "VERSION".bold(),
        "TYPE".bold(),
        "SIGNED".bold(),
        "STATUS".bold()
    );
    for plugin in plugins {
        println!(
            "{:<20} {:<8} {:<12} {:<8} {:<8}",
            plugin.name, plugin.version, plugin.plugin_type, plugin.signed, plugin.status
        );
    }
}

pub fn instance_table(instances: &[InstanceSummary]) {
    if instances.is_empty() {
        println!("No running instances");
        return;
    }
    println!(
        "{:<6} {:<20} {:<8} {:<12} {:<10} {:<24}",
        "ID".bold(),
        "NAME".bold(),
        "VERSION".bold(),
        "TYPE".bold(),
        "HITS".bold(),
        "LAST HIT".bold()
    );
    for instance in instances {
        println!(
            "{:<6} {:<20} {:<8} {:<12} {:<10} {:<24}",
            instance.id,
            instance.name,
            instance.version,
            instance.plugin_type,
            instance.hit_count,
            instance.last_hit.as_deref().unwrap_or("-"),
        );
    }
}

pub fn task_table(tasks: &[TaskSummary]) {
    if tasks.is_empty() {
        println!("No tasks");
        return;
    }
    println!(
        "{:<38} {:<24} {:<10} {:<6} {:<6} {:<6}",
        "ID".bold(),
        "NAME".bold(),
        "STATE".bold(),
        "HIT".bold(),
        "MISS".bold(),
        "FAIL".bold()
    );
    for task in tasks {
        println!(
            "{:<38} {:<24} {:<10} {:<6} {:<6} {:<6}",
            task.id, task.name, task.state, task.hit_count, task.miss_count, task.fail_count
        );
    }
}

pub fn metric_table(metrics: &[MetricSummary]) {
    if metrics.is_empty() {
        println!("No metrics in the catalog");
        return;
    }
    println!(
        "{:<40} {:<8} {:<10} {:<10} {:<6}",
        "NAMESPACE".bold(),
        "VERSION".bold(),
        "TYPE".bold(),
        "UNIT".bold(),
        "SUBS".bold()
    );
    for metric in metrics {
        println!(
            "{:<40} {:<8} {:<10} {:<10} {:<6}",
            metric.namespace,
            metric.version,
            metric.data_type,
            metric.unit.as_deref().unwrap_or("-"),
            metric.subscriptions
        );
    }
}
