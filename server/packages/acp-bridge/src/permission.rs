use serde_json::{json, Value};

pub const REQUEST_PERMISSION_METHOD: &str = "session/request_permission";

const FALLBACK_OPTION_ID: &str = "allow";

/// Builds the reply to `session/request_permission`. Every request is granted.
pub fn grant(params: &Value) -> Value {
    let options = params
        .get("options")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let by_kind = |kind: &str| {
        options
            .iter()
            .find(|option| option.get("kind").and_then(Value::as_str) == Some(kind))
    };
    let chosen = by_kind("allow_always")
        .or_else(|| by_kind("allow_once"))
        .or_else(|| options.first())
        .and_then(|option| option.get("optionId"))
        .and_then(Value::as_str)
        .unwrap_or(FALLBACK_OPTION_ID);

    json!({
        "outcome": {
            "outcome": "selected",
            "optionId": chosen,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn option(id: &str, kind: &str) -> Value {
        json!({ "optionId": id, "name": id, "kind": kind })
    }

    #[test]
    fn prefers_allow_always_then_allow_once() {
        let params = json!({
            "sessionId": "s",
            "options": [
                option("reject", "reject_once"),
                option("once", "allow_once"),
                option("always", "allow_always")
            ]
        });
        assert_eq!(grant(&params)["outcome"]["optionId"], "always");

        let params = json!({
            "options": [option("no", "reject_once"), option("yes", "allow_once")],
        });
        assert_eq!(grant(&params)["outcome"]["optionId"], "yes");
    }

    #[test]
    fn falls_back_to_first_option_or_default() {
        let params = json!({ "options": [option("only", "reject_always")] });
        assert_eq!(grant(&params)["outcome"]["optionId"], "only");

        let granted = grant(&json!({ "sessionId": "s" }));
        assert_eq!(
            granted,
            json!({ "outcome": { "outcome": "selected", "optionId": "allow" } })
        );
    }
}
