//! ---
//! unitd_section: "04-configuration-orchestration"
//! unitd_subsection: "module"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "Uniter mode machine, charm deployment and hook execution."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
//! Hook tool commands evaluated against a [`HookContext`].
use std::collections::BTreeSet;

use unitd_rpc::{PortRange, RebootPriority};

use crate::context::HookContext;
use crate::error::ContextError;

/// Run `tool` with `args`, returning what it prints on success.
pub fn run_tool(ctx: &mut HookContext, tool: &str, args: &[String]) -> Result<String, ContextError> {
    match tool {
        "config-get" => config_get(ctx, args),
        "add-metric" => add_metric(ctx, args),
        "request-reboot" => request_reboot(ctx, args),
        "open-port" => {
            ctx.open_port(single_range(tool, args)?)?;
            Ok(String::new())
        }
        "close-port" => {
            ctx.close_port(single_range(tool, args)?)?;
            Ok(String::new())
        }
        "opened-ports" => {
            no_args(tool, args)?;
            Ok(ctx
                .opened_ports()
                .iter()
                .map(|range| format!("{range}\n"))
                .collect())
        }
        "unit-get" => match args {
            [key] => Ok(format!("{}\n", ctx.unit_get(key)?)),
            _ => Err(ContextError::arguments(tool, "expected exactly one setting name")),
        },
        "relation-get" | "relation-set" | "relation-list" | "relation-ids" => {
            Err(ContextError::NotImplemented(tool.to_owned()))
        }
        other => Err(ContextError::UnknownTool(other.to_owned())),
    }
}

fn config_get(ctx: &HookContext, args: &[String]) -> Result<String, ContextError> {
    let value = match args {
        [] => ctx.config(None),
        [key] => ctx.config(Some(key.as_str())),
        _ => return Err(ContextError::arguments("config-get", "expected at most one key")),
    };
    Ok(format!("{value}\n"))
}

fn add_metric(ctx: &mut HookContext, args: &[String]) -> Result<String, ContextError> {
    const TOOL: &str = "add-metric";
    if args.is_empty() {
        return Err(ContextError::arguments(TOOL, "expected key=value pairs"));
    }
    let mut seen = BTreeSet::new();
    let mut samples = Vec::with_capacity(args.len());
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| ContextError::arguments(TOOL, format!("expected key=value, got {arg:?}")))?;
        if key.is_empty() || value.is_empty() {
            return Err(ContextError::arguments(TOOL, format!("empty key or value in {arg:?}")));
        }
        if !seen.insert(key) {
            return Err(ContextError::arguments(TOOL, format!("duplicate key {key:?}")));
        }
        samples.push((key.to_owned(), value.to_owned()));
    }
    ctx.add_metrics(&samples)?;
    Ok(String::new())
}

fn request_reboot(ctx: &mut HookContext, args: &[String]) -> Result<String, ContextError> {
    let priority = match args {
        [] => RebootPriority::AfterHook,
        [flag] if flag == "--now" => RebootPriority::Now,
        _ => return Err(ContextError::arguments("request-reboot", "usage: request-reboot [--now]")),
    };
    ctx.request_reboot(priority);
    Ok(String::new())
}

fn single_range(tool: &str, args: &[String]) -> Result<PortRange, ContextError> {
    match args {
        [range] => Ok(range.parse()?),
        _ => Err(ContextError::arguments(tool, "expected <port>[-<to>][/<protocol>]")),
    }
}

fn no_args(tool: &str, args: &[String]) -> Result<(), ContextError> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(ContextError::arguments(tool, "takes no arguments"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use serde_json::Value;
    use unitd_persistence::{HookInfo, HookKind};
    use unitd_rpc::UnitDoc;

    use crate::charm::MetricsDeclaration;

    fn ctx() -> HookContext {
        let declared = MetricsDeclaration::from_yaml("metrics:\n  pings:\n    type: gauge\n").unwrap();
        HookContext::new(
            &UnitDoc::new("wordpress/0", "wordpress"),
            HookInfo::new(HookKind::ConfigChanged),
            BTreeMap::from([("port".to_owned(), Value::from(8080))]),
            Some(declared),
        )
    }

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn config_get_prints_json() {
        let mut ctx = ctx();
        assert_eq!(run_tool(&mut ctx, "config-get", &args(&["port"])).unwrap(), "8080\n");
        assert_eq!(run_tool(&mut ctx, "config-get", &[]).unwrap(), "{\"port\":8080}\n");
    }

    #[test]
    fn add_metric_validates_arguments() {
        let mut ctx = ctx();
        run_tool(&mut ctx, "add-metric", &args(&["pings=4"])).unwrap();
        for bad in [vec![], args(&["pings"]), args(&["pings="]), args(&["pings=1", "pings=2"])] {
            assert!(matches!(
                run_tool(&mut ctx, "add-metric", &bad),
                Err(ContextError::InvalidArguments { .. })
            ));
        }
        assert_eq!(ctx.take_outcome().metrics.len(), 1);
    }

    #[test]
    fn port_tools_round_trip_through_context() {
        let mut ctx = ctx();
        run_tool(&mut ctx, "open-port", &args(&["8080"])).unwrap();
        run_tool(&mut ctx, "open-port", &args(&["53/udp"])).unwrap();
        assert_eq!(
            run_tool(&mut ctx, "opened-ports", &[]).unwrap(),
            "53/udp\n8080/tcp\n"
        );
        assert!(matches!(
            run_tool(&mut ctx, "open-port", &args(&["8000-8100"])),
            Err(ContextError::PortRangeConflict { .. })
        ));
        assert!(matches!(
            run_tool(&mut ctx, "open-port", &args(&["0"])),
            Err(ContextError::InvalidPortRange(_))
        ));
    }

    #[test]
    fn reboot_and_unknown_tools() {
        let mut ctx = ctx();
        run_tool(&mut ctx, "request-reboot", &args(&["--now"])).unwrap();
        assert_eq!(ctx.take_outcome().reboot, Some(RebootPriority::Now));
        assert!(matches!(
            run_tool(&mut ctx, "relation-get", &[]),
            Err(ContextError::NotImplemented(_))
        ));
        assert!(matches!(
            run_tool(&mut ctx, "status-set", &[]),
            Err(ContextError::UnknownTool(_))
        ));
        assert_eq!(run_tool(&mut ctx, "unit-get", &args(&["name"])).unwrap(), "wordpress/0\n");
    }
}
