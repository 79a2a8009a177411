use std::io;
use std::io::IsTerminal;
use std::io::Write;

use anyhow::{Result, bail};
use serde_json::{Value as Json, json};
use tokio::sync::mpsc;

use recollect_memory::codec::value_from_json;
use recollect_memory::{
    AddRequest, ChannelProgress, FilterValue, Filters, MemoryService, NoopProgress, Payload,
    PayloadValue, ProgressEvent, ScopeIds,
};

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) async fn run_add(
    service: &MemoryService,
    text: String,
    scope: ScopeIds,
    metadata: &[String],
    filters: &[String],
    show_progress: bool,
) -> Result<()> {
    let req = AddRequest {
        text,
        scope,
        metadata: parse_metadata(metadata)?,
        filters: parse_filters(filters)?,
    };

    let outcome = if show_progress {
        let (tx, rx) = mpsc::unbounded_channel();
        let printer = tokio::spawn(print_progress(rx));
        let outcome = service.add(req, &ChannelProgress::new(tx)).await;
        // The sink (and its sender) is gone once `add` returns.
        let _ = printer.await;
        outcome?
    } else {
        service.add(req, &NoopProgress).await?
    };
    print_json(&outcome)
}

async fn print_progress(mut rx: mpsc::UnboundedReceiver<ProgressEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            ProgressEvent::FactsExtracted { count } => eprintln!("· extracted {count} fact(s)"),
            ProgressEvent::FactSearched { ordinal, neighbours } => {
                eprintln!("· fact {ordinal}: {neighbours} similar memor(ies)")
            }
            ProgressEvent::IntentsDecided { count } => eprintln!("· decided {count} change(s)"),
            ProgressEvent::MutationApplied { memory_id, event } => {
                eprintln!("· {event} {memory_id}")
            }
            ProgressEvent::IntentSkipped { index, kind, reason } => {
                eprintln!("· skipped #{index} ({kind}): {reason}")
            }
        }
    }
}

pub(crate) async fn run_get(service: &MemoryService, id: &str) -> Result<()> {
    match service.get(id).await? {
        Some(item) => print_json(&item),
        None => bail!("memory {id} not found"),
    }
}

pub(crate) async fn run_list(service: &MemoryService, scope: &ScopeIds, limit: Option<usize>) -> Result<()> {
    let items = service.get_all(scope, limit).await?;
    print_json(&json!({ "results": items }))
}

pub(crate) async fn run_search(
    service: &MemoryService,
    query: &str,
    scope: &ScopeIds,
    filters: &[String],
    limit: usize,
    min_score: Option<f32>,
) -> Result<()> {
    let filters = parse_filters(filters)?;
    let items = service.search(query, scope, &filters, limit, min_score).await?;
    print_json(&json!({ "results": items }))
}

pub(crate) async fn run_update(service: &MemoryService, id: &str, text: &str) -> Result<()> {
    let applied = service.update(id, text).await?;
    print_json(&applied)
}

pub(crate) async fn run_delete(service: &MemoryService, id: &str) -> Result<()> {
    let applied = service.delete(id).await?;
    print_json(&applied)
}

pub(crate) async fn run_history(service: &MemoryService, id: &str) -> Result<()> {
    let entries = service.history(id).await?;
    print_json(&entries)
}

pub(crate) async fn run_delete_all(service: &MemoryService, scope: &ScopeIds, yes: bool) -> Result<()> {
    if scope.is_empty() {
        bail!("delete-all needs --user, --agent or --run");
    }
    let targeted = service.get_all(scope, None).await?.len();
    println!("⚠️  destructive operation: delete all memories in {}", scope.label());
    println!("- targeted memories: {targeted}");
    if targeted == 0 {
        println!("nothing to delete");
        return Ok(());
    }
    if !confirm(yes, "DELETE ALL")? {
        println!("delete-all cancelled");
        return Ok(());
    }
    let deleted = service.delete_all(scope).await?;
    println!("deleted {deleted} of {targeted} memories");
    Ok(())
}

pub(crate) async fn run_reset(service: &MemoryService, yes: bool) -> Result<()> {
    println!("⚠️  destructive operation: reset");
    println!("- vector store: {}", service.store().name());
    match service.journal().path() {
        Some(path) => println!("- history journal: {}", path.display()),
        None => println!("- history journal: in memory"),
    }
    if !confirm(yes, "RESET")? {
        println!("reset cancelled");
        return Ok(());
    }
    service.reset().await?;
    println!("reset complete");
    Ok(())
}

fn confirm(yes: bool, expected: &str) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    if !io::stdin().is_terminal() {
        bail!("refusing destructive operation in non-interactive mode without --yes");
    }
    print!("This cannot be undone. Type '{expected}' to continue: ");
    io::stdout().flush()?;
    let mut confirmation = String::new();
    io::stdin().read_line(&mut confirmation)?;
    Ok(confirmation.trim() == expected)
}

fn split_pair(raw: &str) -> Result<(String, &str)> {
    match raw.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim())),
        _ => bail!("expected KEY=VALUE, got '{raw}'"),
    }
}

/// Values that parse as JSON keep their JSON type (numbers, booleans, string
/// lists); anything else is taken as a plain string.
fn parse_value(key: &str, raw: &str) -> Result<PayloadValue> {
    match serde_json::from_str::<Json>(raw) {
        Ok(json) => Ok(value_from_json(key, &json)?),
        Err(_) => Ok(PayloadValue::from(raw)),
    }
}

pub(crate) fn parse_metadata(pairs: &[String]) -> Result<Payload> {
    let mut payload = Payload::new();
    for raw in pairs {
        let (key, value) = split_pair(raw)?;
        let value = parse_value(&key, value)?;
        payload.insert(key, value);
    }
    Ok(payload)
}

/// `key=a,b` or `key=["a","b"]` matches records whose `key` is any of `a`
/// or `b`.
pub(crate) fn parse_filters(pairs: &[String]) -> Result<Filters> {
    let mut filters = Filters::new();
    for raw in pairs {
        let (key, value) = split_pair(raw)?;
        let filter = match serde_json::from_str::<Json>(value) {
            Ok(json) => FilterValue::from(value_from_json(&key, &json)?),
            Err(_) if value.contains(',') => FilterValue::AnyOf(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(|v| parse_value(&key, v))
                    .collect::<Result<_>>()?,
            ),
            Err(_) => FilterValue::One(PayloadValue::from(value)),
        };
        filters.insert(key, filter);
    }
    Ok(filters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_values_keep_their_types() {
        let payload = parse_metadata(&[
            "source=chat".to_string(),
            "priority=3".to_string(),
            "pinned=true".to_string(),
            "weight=0.5".to_string(),
        ])
        .unwrap();
        assert_eq!(payload["source"], PayloadValue::from("chat"));
        assert_eq!(payload["priority"], PayloadValue::Int(3));
        assert_eq!(payload["pinned"], PayloadValue::Bool(true));
        assert_eq!(payload["weight"], PayloadValue::Float(0.5));
    }

    #[test]
    fn comma_separated_filter_matches_any() {
        let filters = parse_filters(&["tags=food, travel".to_string(), "lang=en".to_string()]).unwrap();
        assert_eq!(
            filters["tags"],
            FilterValue::AnyOf(vec!["food".into(), "travel".into()])
        );
        assert_eq!(filters["lang"], FilterValue::One("en".into()));
    }

    #[test]
    fn json_values_go_through_the_payload_codec() {
        let payload = parse_metadata(&[
            r#"tags=["food","travel"]"#.to_string(),
            r#"label="42""#.to_string(),
            "score=NaN".to_string(),
            "big=1e999".to_string(),
        ])
        .unwrap();
        assert_eq!(
            payload["tags"],
            PayloadValue::StringList(vec!["food".into(), "travel".into()])
        );
        assert_eq!(payload["label"], PayloadValue::from("42"));
        // Not JSON numbers, so they stay text instead of becoming NaN or inf.
        assert_eq!(payload["score"], PayloadValue::from("NaN"));
        assert_eq!(payload["big"], PayloadValue::from("1e999"));

        assert!(parse_metadata(&[r#"nested={"a":1}"#.to_string()]).is_err());
        assert!(parse_metadata(&["gone=null".to_string()]).is_err());
        assert!(parse_metadata(&["mixed=[1,2]".to_string()]).is_err());
    }

    #[test]
    fn json_list_filter_matches_any_and_numbers_stay_numeric() {
        let filters = parse_filters(&[
            r#"tags=["food","travel"]"#.to_string(),
            "priority=1,2".to_string(),
            "score=NaN".to_string(),
        ])
        .unwrap();
        assert_eq!(
            filters["tags"],
            FilterValue::AnyOf(vec!["food".into(), "travel".into()])
        );
        assert_eq!(
            filters["priority"],
            FilterValue::AnyOf(vec![PayloadValue::Int(1), PayloadValue::Int(2)])
        );
        assert_eq!(filters["score"], FilterValue::One("NaN".into()));
    }

    #[test]
    fn pairs_without_a_key_are_rejected() {
        assert!(parse_metadata(&["=oops".to_string()]).is_err());
        assert!(parse_filters(&["no-equals".to_string()]).is_err());
    }
}
