//! Rule catalog.

use serde::Serialize;

use crate::diagnostic::Severity;

pub const DEADLOCK: &str = "BLOCK001";
pub const LEAK: &str = "BLOCK002";
pub const PARTIAL_DEADLOCK: &str = "BLOCK003";
pub const DEFINITE_PANIC: &str = "PANIC001";

#[derive(Debug, Clone, Serialize)]
pub struct RuleInfo {
    pub code: String,
    pub name: String,
    pub description: String,
    pub severity: Severity,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example_bad: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example_good: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub go_idiom: Option<String>,
}

/// Look up a single rule by code, ignoring case.
pub fn get_rule(code: &str) -> Option<RuleInfo> {
    get_all_rules()
        .into_iter()
        .find(|r| r.code.eq_ignore_ascii_case(code))
}

pub fn get_all_rules() -> Vec<RuleInfo> {
    vec![
        RuleInfo {
            code: DEADLOCK.into(),
            name: "Deadlock".into(),
            description: "Every live goroutine waits on a channel or lock that no other goroutine will ever serve, or a goroutine waits on a lock it holds itself.".into(),
            severity: Severity::Critical,
            category: "blocking".into(),
            example_bad: Some("mu.Lock()\nif closed {\n    return // mu stays locked\n}\nmu.Unlock()".into()),
            example_good: Some("mu.Lock()\ndefer mu.Unlock()\nif closed {\n    return\n}".into()),
            go_idiom: Some("Pair every Lock with a deferred Unlock".into()),
        },
        RuleInfo {
            code: LEAK.into(),
            name: "Goroutine leak".into(),
            description: "A goroutine blocks forever on a channel operation or wait after everything else has finished.".into(),
            severity: Severity::Error,
            category: "blocking".into(),
            example_bad: Some("ch := make(chan int)\ngo func() { ch <- compute() }()\nselect {\ncase v := <-ch:\n    use(v)\ncase <-time.After(time.Second):\n    return // the sender leaks\n}".into()),
            example_good: Some("ch := make(chan int, 1)\ngo func() { ch <- compute() }()".into()),
            go_idiom: Some("Give result channels a buffer of one when the receiver may give up".into()),
        },
        RuleInfo {
            code: PARTIAL_DEADLOCK.into(),
            name: "Partial deadlock".into(),
            description: "Some goroutines block forever while others keep running.".into(),
            severity: Severity::Warning,
            category: "blocking".into(),
            example_bad: Some("go func() { <-done }() // done is never closed\nfor { serve() }".into()),
            example_good: Some("defer close(done)\ngo func() { <-done }()".into()),
            go_idiom: Some("Close a done channel to release every waiter".into()),
        },
        RuleInfo {
            code: DEFINITE_PANIC.into(),
            name: "Concurrency panic".into(),
            description: "An operation always panics at run time: send on or close of a closed channel, close of a nil channel, unlock of an unlocked mutex or a negative WaitGroup counter.".into(),
            severity: Severity::Critical,
            category: "panic".into(),
            example_bad: Some("close(ch)\nch <- 1 // send on closed channel".into()),
            example_good: Some("ch <- 1\nclose(ch)".into()),
            go_idiom: Some("Only the sender closes a channel, and only once".into()),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_returns_all() {
        let codes: Vec<String> = get_all_rules().into_iter().map(|r| r.code).collect();
        assert_eq!(codes, vec!["BLOCK001", "BLOCK002", "BLOCK003", "PANIC001"]);
    }

    #[test]
    fn test_rules_have_required_fields() {
        for rule in get_all_rules() {
            assert!(!rule.name.is_empty());
            assert!(!rule.description.is_empty());
            assert!(!rule.category.is_empty());
            assert!(rule.example_bad.is_some());
        }
    }

    #[test]
    fn test_get_rule_is_case_insensitive() {
        let rule = get_rule("block002").unwrap();
        assert_eq!(rule.code, LEAK);
        assert_eq!(rule.severity, Severity::Error);
        assert!(get_rule("NIL001").is_none());
    }

    #[test]
    fn test_rule_serialization() {
        let json = serde_json::to_string_pretty(&get_rule(DEFINITE_PANIC).unwrap()).unwrap();
        assert!(json.contains("\"severity\": \"critical\""));
        assert!(json.contains("example_good"));
    }
}
