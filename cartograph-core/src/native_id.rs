//! Best-effort decomposition of provider-native identifiers.
//!
//! Handles ARN-style ids (`arn:aws:ec2:us-east-1:111111111111:instance/i-abc`,
//! resource part delimited by `:` or `/`) and path-style ids
//! (`projects/p/zones/z/instances/vm-1`). Anything else is treated as a bare
//! resource id.

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedNativeId {
    pub partition: Option<String>,
    pub service: Option<String>,
    pub region: Option<String>,
    pub account: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: String,
}

pub fn parse_native_id(raw: &str) -> ParsedNativeId {
    if raw.starts_with("arn:") {
        return parse_arn(raw);
    }
    if raw.contains('/') {
        return parse_path(raw);
    }
    ParsedNativeId {
        resource_id: raw.to_string(),
        ..Default::default()
    }
}

/// The trailing resource id, used for suffix matching when resolving edge
/// references against stored nodes.
pub fn resource_suffix(raw: &str) -> &str {
    let parsed_tail = raw
        .rsplit(|c| c == ':' || c == '/')
        .next()
        .unwrap_or(raw);
    if parsed_tail.is_empty() {
        raw
    } else {
        parsed_tail
    }
}

fn parse_arn(raw: &str) -> ParsedNativeId {
    // arn:partition:service:region:account:resource[...]
    let mut parts = raw.splitn(6, ':');
    let _arn = parts.next();
    let partition = parts.next().map(str::to_string);
    let service = parts.next().map(str::to_string);
    let region = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
    let account = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
    let resource = parts.next().unwrap_or_default();

    // The resource part is either "type/id", "type:id" or a bare id.
    let (resource_type, resource_id) = match resource.split_once(|c| c == '/' || c == ':') {
        Some((kind, id)) if !id.is_empty() => (Some(kind.to_string()), id.to_string()),
        _ => (None, resource.to_string()),
    };

    ParsedNativeId {
        partition,
        service,
        region,
        account,
        resource_type,
        resource_id,
    }
}

fn parse_path(raw: &str) -> ParsedNativeId {
    let segments: Vec<&str> = raw.split('/').filter(|s| !s.is_empty()).collect();
    let mut parsed = ParsedNativeId {
        resource_id: segments.last().map(|s| s.to_string()).unwrap_or_default(),
        ..Default::default()
    };
    for pair in segments.chunks(2) {
        let [kind, value] = pair else { break };
        match *kind {
            "projects" | "subscriptions" | "accounts" => {
                parsed.account = Some(value.to_string());
            }
            "zones" | "regions" | "locations" => {
                parsed.region = Some(value.to_string());
            }
            _ => {
                parsed.resource_type = Some(kind.to_string());
                parsed.resource_id = value.to_string();
            }
        }
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arn_with_slash_resource() {
        let parsed = parse_native_id("arn:aws:ec2:us-east-1:111111111111:instance/i-abc");
        assert_eq!(parsed.partition.as_deref(), Some("aws"));
        assert_eq!(parsed.service.as_deref(), Some("ec2"));
        assert_eq!(parsed.region.as_deref(), Some("us-east-1"));
        assert_eq!(parsed.account.as_deref(), Some("111111111111"));
        assert_eq!(parsed.resource_type.as_deref(), Some("instance"));
        assert_eq!(parsed.resource_id, "i-abc");
    }

    #[test]
    fn parses_arn_with_colon_resource() {
        let parsed = parse_native_id("arn:aws:lambda:eu-west-1:222222222222:function:ingest");
        assert_eq!(parsed.resource_type.as_deref(), Some("function"));
        assert_eq!(parsed.resource_id, "ingest");
    }

    #[test]
    fn parses_global_arn_without_region() {
        let parsed = parse_native_id("arn:aws:iam::111111111111:role/deploy");
        assert_eq!(parsed.region, None);
        assert_eq!(parsed.account.as_deref(), Some("111111111111"));
        assert_eq!(parsed.resource_type.as_deref(), Some("role"));
        assert_eq!(parsed.resource_id, "deploy");
    }

    #[test]
    fn parses_gcp_style_path() {
        let parsed = parse_native_id("projects/acme-prod/zones/us-central1-a/instances/vm-1");
        assert_eq!(parsed.account.as_deref(), Some("acme-prod"));
        assert_eq!(parsed.region.as_deref(), Some("us-central1-a"));
        assert_eq!(parsed.resource_type.as_deref(), Some("instances"));
        assert_eq!(parsed.resource_id, "vm-1");
    }

    #[test]
    fn bare_ids_pass_through() {
        let parsed = parse_native_id("i-0123456789");
        assert_eq!(parsed.resource_id, "i-0123456789");
        assert_eq!(parsed.partition, None);
    }

    #[test]
    fn suffix_extraction() {
        assert_eq!(
            resource_suffix("arn:aws:ec2:us-east-1:1:instance/i-abc"),
            "i-abc"
        );
        assert_eq!(resource_suffix("plain-id"), "plain-id");
    }
}
