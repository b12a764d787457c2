//! Best-effort repair of truncated model output. Generative models stop
//! mid-token often enough that a dangling quote or an unclosed brace is the
//! common failure shape; balancing those rescues the payload without
//! touching its content. Purely syntactic, no semantic validation.

/// Close unbalanced quotes, braces and brackets in that order.
///
/// Idempotent: already-balanced input (including valid JSON) comes back
/// unchanged apart from trimming.
pub fn repair_json(input: &str) -> String {
    let mut repaired = input.trim().to_string();

    if repaired.matches('"').count() % 2 == 1 {
        repaired.push('"');
    }

    let open_braces = repaired.matches('{').count();
    let close_braces = repaired.matches('}').count();
    for _ in close_braces..open_braces {
        repaired.push('}');
    }

    let open_brackets = repaired.matches('[').count();
    let close_brackets = repaired.matches(']').count();
    for _ in close_brackets..open_brackets {
        repaired.push(']');
    }

    repaired
}
