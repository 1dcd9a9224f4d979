//! Remote commands and parsers for their output.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::cluster::{ContainerStats, MachineStats};

/// Separates the sections of [`CONTAINER_STATS_COMMAND`] output.
pub const SECTION_DELIMITER: &str = "---cluster-edge---";

/// Prints `cpu=`, `mem=` and `disk=` lines, all in percent.
pub const MACHINE_STATS_COMMAND: &str = concat!(
    "top -bn1 | awk '/Cpu\\(s\\)/{print \"cpu=\" $2 + $4; exit}'",
    " && free -m | awk 'NR==2{printf \"mem=%.2f\\n\", $3*100/$2}'",
    " && df / | awk 'NR==2{print \"disk=\" $5}'",
);

/// Port map, live usage and on-disk size, one section each.
pub const CONTAINER_STATS_COMMAND: &str = concat!(
    "docker ps --format '{{.Names}}|{{.Ports}}'",
    " && echo '---cluster-edge---'",
    " && docker stats --no-stream --format '{{.Name}}|{{.CPUPerc}}|{{.MemPerc}}'",
    " && echo '---cluster-edge---'",
    " && docker ps --size --format '{{.Names}}|{{.Size}}'",
);

static HOST_PORT: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r":(\d+)->").ok());

/// Parses a percentage such as `12.5`, `12.5%` or `12,5%`. Anything else is `0.0`.
pub fn parse_percent(raw: &str) -> f64 {
    let trimmed = raw.trim().trim_end_matches('%').trim();
    trimmed
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// First published host port in a `docker ps` ports column, or `""`.
///
/// `0.0.0.0:8080->80/tcp, :::8080->80/tcp` yields `8080`.
pub fn extract_host_port(ports: &str) -> String {
    HOST_PORT
        .as_ref()
        .and_then(|re| re.captures(ports))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

pub fn parse_machine_stats(output: &str) -> MachineStats {
    let mut stats = MachineStats::default();
    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        match key.trim() {
            "cpu" => stats.cpu = parse_percent(value),
            "mem" => stats.memory = parse_percent(value),
            "disk" => stats.disk = parse_percent(value),
            _ => {}
        }
    }
    stats
}

/// Joins the three container sections by container name.
///
/// Containers missing from the live-usage section are not running and are
/// dropped. Missing port or size entries become empty strings.
pub fn parse_container_stats(output: &str) -> Vec<ContainerStats> {
    let mut sections = output.split(SECTION_DELIMITER);
    let ports = pipe_pairs(sections.next().unwrap_or_default());
    let usage = sections.next().unwrap_or_default();
    let sizes = pipe_pairs(sections.next().unwrap_or_default());

    let mut containers = Vec::new();
    for line in usage.lines() {
        let mut fields = line.split('|').map(str::trim);
        let (Some(name), Some(cpu), Some(memory)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        containers.push(ContainerStats {
            name: name.to_string(),
            cpu: parse_percent(cpu),
            memory: parse_percent(memory),
            disk: sizes.get(name).map(|s| s.to_string()).unwrap_or_default(),
            external_port: ports
                .get(name)
                .map(|p| extract_host_port(p))
                .unwrap_or_default(),
        });
    }
    containers
}

fn pipe_pairs(section: &str) -> HashMap<&str, &str> {
    section
        .lines()
        .filter_map(|line| line.split_once('|'))
        .map(|(name, value)| (name.trim(), value.trim()))
        .filter(|(name, _)| !name.is_empty())
        .collect()
}
