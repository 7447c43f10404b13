//! Topic codec for the IoT hub MQTT surface.
//!
//! Translates between the semantic message abstraction and the wire
//! topic/payload pair for telemetry, direct methods and device twin
//! operations, including the URL-encoded property segment appended to
//! publish topics.

use std::collections::HashMap;

use mqtt::topic_name::TopicNameError;
use mqtt::TopicName;

use crate::message::Message;
use crate::settings::TransportSettings;

// Incoming topic names
pub(crate) const METHOD_POST_TOPIC_FILTER: &str = "$iothub/methods/POST/#";
pub(crate) const METHOD_POST_TOPIC_PREFIX: &str = "$iothub/methods/POST/";
pub(crate) const TWIN_RESPONSE_TOPIC_FILTER: &str = "$iothub/twin/res/#";
const TWIN_RESPONSE_TOPIC_PREFIX: &str = "$iothub/twin/res/";
pub(crate) const TWIN_PATCH_TOPIC_FILTER: &str = "$iothub/twin/PATCH/properties/desired/#";
const TWIN_PATCH_TOPIC_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";
const TWIN_PATCH_UPDATE_PREFIX: &str = "$iothub/twin/PATCH/properties/reported/";

const REQUEST_ID_KEY: &str = "$rid";
const VERSION_KEY: &str = "$version";
const INPUTS_SEGMENT: &str = "inputs/";

// Outgoing topic names
pub(crate) fn method_response_topic(status: i32, request_id: &str) -> String {
    format!("$iothub/methods/res/{}/?$rid={}", status, request_id)
}

pub(crate) fn twin_get_topic(request_id: &str) -> String {
    format!("$iothub/twin/GET/?$rid={}", request_id)
}

pub(crate) fn twin_update_topic(request_id: &str) -> String {
    format!("{}?$rid={}", TWIN_PATCH_UPDATE_PREFIX, request_id)
}

pub(crate) fn device_bound_messages_topic_filter(device_id: &str) -> String {
    format!("devices/{}/messages/devicebound/#", device_id)
}

fn device_bound_messages_topic_prefix(device_id: &str) -> String {
    format!("devices/{}/messages/devicebound/", device_id)
}

pub(crate) fn cloud_bound_messages_topic(device_id: &str) -> String {
    format!("devices/{}/messages/events/", device_id)
}

pub(crate) fn module_cloud_bound_messages_topic(device_id: &str, module_id: &str) -> String {
    format!("devices/{}/modules/{}/messages/events/", device_id, module_id)
}

pub(crate) fn module_input_events_topic_filter(device_id: &str, module_id: &str) -> String {
    format!("devices/{}/modules/{}/#", device_id, module_id)
}

fn module_input_events_topic_prefix(device_id: &str, module_id: &str) -> String {
    format!("devices/{}/modules/{}/", device_id, module_id)
}

/// Percent-encode a property mapping into the `key=value&...` segment
/// appended to publish topics. A `None` value encodes as a bare key.
pub fn encode_properties(properties: &HashMap<String, Option<String>>) -> String {
    let mut segments = Vec::with_capacity(properties.len());
    for (key, value) in properties {
        let mut segment: String = form_urlencoded::byte_serialize(key.as_bytes()).collect();
        if let Some(value) = value {
            segment.push('=');
            segment.extend(form_urlencoded::byte_serialize(value.as_bytes()));
        }
        segments.push(segment);
    }
    segments.join("&")
}

/// Decode a `key=value&...` property segment. An empty segment (including a
/// slice taken past the end of the topic) yields an empty mapping; a bare key
/// with no `=` decodes to a `None` value.
pub fn decode_properties(segment: &str) -> HashMap<String, Option<String>> {
    let mut properties = HashMap::new();
    for pair in segment.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) => {
                properties.insert(decode_component(key), Some(decode_component(value)));
            }
            None => {
                properties.insert(decode_component(pair), None);
            }
        }
    }
    properties
}

fn decode_component(raw: &str) -> String {
    // form_urlencoded escapes space as '+' on the way out
    let raw = raw.replace('+', " ");
    percent_encoding::percent_decode_str(&raw)
        .decode_utf8_lossy()
        .into_owned()
}

/// Copy a decoded property segment into a message, applying the hub's `$.`
/// prefix convention for system properties.
pub(crate) fn apply_properties(message: &mut Message, segment: &str) {
    for (key, value) in decode_properties(segment) {
        let value = value.unwrap_or_default();
        if let Some(stripped) = key.strip_prefix("$.") {
            message.system_properties.insert(stripped.to_string(), value);
        } else {
            message.properties.insert(key, value);
        }
    }
}

pub(crate) fn build_topic_name(
    base_topic: &TopicName,
    message: &Message,
) -> Result<TopicName, TopicNameError> {
    let capacity = message.system_properties.len() + message.properties.len();
    let mut props = HashMap::with_capacity(capacity);
    props.extend(message.system_properties.iter());
    props.extend(message.properties.iter());

    // if we reuse the base_topic string as the target for the serializer,
    // we end up with an extra ampersand before the key/value pairs
    let encoded = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(props.iter())
        .finish();
    TopicName::new(format!("{}{}", base_topic.to_string(), encoded))
}

/// Classification of an inbound PUBLISH by topic shape.
#[derive(Debug)]
pub(crate) enum InboundTopic<'a> {
    TwinResponse {
        status: i32,
        request_id: String,
        version: Option<String>,
    },
    TwinDesiredPatch {
        properties: &'a str,
    },
    MethodRequest {
        method_name: &'a str,
        request_id: String,
    },
    DeviceBound {
        properties: &'a str,
    },
    InputEvent {
        input_name: Option<&'a str>,
        properties: &'a str,
    },
    Unknown,
}

/// Matches inbound topics against the identity-specific prefixes of one
/// connection. Built once per handler.
#[derive(Debug)]
pub(crate) struct TopicMatcher {
    device_bound_prefix: String,
    module_prefix: Option<String>,
}

impl TopicMatcher {
    pub(crate) fn new(settings: &TransportSettings) -> Self {
        Self {
            device_bound_prefix: device_bound_messages_topic_prefix(&settings.device_id),
            module_prefix: settings
                .module_id
                .as_ref()
                .map(|module_id| module_input_events_topic_prefix(&settings.device_id, module_id)),
        }
    }

    /// Classify a publish topic. Unmatched shapes map to `Unknown` and are
    /// dropped by the dispatcher so new server-side topics never fault the
    /// connection.
    pub(crate) fn classify<'a>(&self, topic: &'a str) -> InboundTopic<'a> {
        if let Some(rest) = topic.strip_prefix(TWIN_RESPONSE_TOPIC_PREFIX) {
            return parse_twin_response(rest);
        }

        if let Some(rest) = topic.strip_prefix(TWIN_PATCH_TOPIC_PREFIX) {
            return InboundTopic::TwinDesiredPatch {
                properties: trailing_properties(rest),
            };
        }

        if let Some(rest) = topic.strip_prefix(METHOD_POST_TOPIC_PREFIX) {
            // Format: {method name}/?$rid={request id}
            if let Some((method_name, params)) = rest.split_once('/') {
                if let Some(request_id) = request_id_from(params) {
                    return InboundTopic::MethodRequest {
                        method_name,
                        request_id,
                    };
                }
            }
            return InboundTopic::Unknown;
        }

        if let Some(rest) = topic.strip_prefix(&self.device_bound_prefix) {
            return InboundTopic::DeviceBound { properties: rest };
        }

        if let Some(module_prefix) = &self.module_prefix {
            if let Some(rest) = topic.strip_prefix(module_prefix.as_str()) {
                // Input events arrive on .../inputs/{input name}/{properties}
                if let Some(rest) = rest.strip_prefix(INPUTS_SEGMENT) {
                    if let Some((input_name, properties)) = rest.split_once('/') {
                        return InboundTopic::InputEvent {
                            input_name: Some(input_name),
                            properties,
                        };
                    }
                }
                return InboundTopic::InputEvent {
                    input_name: None,
                    properties: trailing_properties(rest),
                };
            }
        }

        InboundTopic::Unknown
    }
}

// Format: {status}/?$rid={request id}[&$version={n}]
fn parse_twin_response(rest: &str) -> InboundTopic<'_> {
    let (status, params) = match rest.split_once('/') {
        Some(parts) => parts,
        None => return InboundTopic::Unknown,
    };
    let status = match status.parse::<i32>() {
        Ok(status) => status,
        Err(_) => return InboundTopic::Unknown,
    };

    let params = params.trim_start_matches('?');
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(params).unwrap_or_default();

    let mut request_id = None;
    let mut version = None;
    for (key, value) in pairs {
        match key.as_str() {
            REQUEST_ID_KEY => request_id = Some(value),
            VERSION_KEY => version = Some(value),
            _ => {}
        }
    }

    match request_id {
        Some(request_id) => InboundTopic::TwinResponse {
            status,
            request_id,
            version,
        },
        None => InboundTopic::Unknown,
    }
}

fn request_id_from(params: &str) -> Option<String> {
    let params = params.trim_start_matches('?');
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(params).ok()?;
    pairs
        .into_iter()
        .find(|(key, _)| key == REQUEST_ID_KEY)
        .map(|(_, value)| value)
}

// Desired patches and module events carry their query segment after a '?'
fn trailing_properties(rest: &str) -> &str {
    match rest.split_once('?') {
        Some((_, properties)) => properties,
        None => rest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn matcher() -> TopicMatcher {
        TopicMatcher::new(&TransportSettings::new_module(
            "myhub.azure-devices.net",
            "dev1",
            "mod1",
        ))
    }

    #[test]
    fn properties_round_trip() {
        let mut props = HashMap::new();
        props.insert("foo".to_string(), Some("bar baz".to_string()));
        props.insert("$.ct".to_string(), Some("application/json".to_string()));
        props.insert("flag".to_string(), None);
        props.insert("sig".to_string(), Some("dg==".to_string()));

        assert_eq!(decode_properties(&encode_properties(&props)), props);
    }

    #[test]
    fn empty_mapping_round_trips() {
        let props = HashMap::new();
        assert_eq!(encode_properties(&props), "");
        assert_eq!(decode_properties(""), props);
    }

    #[test]
    fn decode_past_end_of_topic_is_empty() {
        let topic = "devices/dev1/messages/devicebound/";
        let segment = topic.get(64..).unwrap_or("");
        assert!(decode_properties(segment).is_empty());
    }

    #[test]
    fn bare_key_decodes_to_null_value() {
        let props = decode_properties("flag&foo=bar");
        assert_eq!(props["flag"], None);
        assert_eq!(props["foo"], Some("bar".to_string()));
    }

    #[test]
    fn content_type_is_appended_to_topic_name() {
        let message = Message::builder()
            .set_body(vec![])
            .set_content_type("application/json".to_owned())
            .build();

        let base_topic = TopicName::new("topic/").unwrap();

        let topic_with_properties = build_topic_name(&base_topic, &message).unwrap().to_string();

        assert_eq!("topic/%24.ct=application%2Fjson", topic_with_properties);
    }

    #[test]
    fn no_system_properties() {
        let message = Message::new(vec![]);
        let base_topic = TopicName::new("topic/").unwrap();
        let actual = build_topic_name(&base_topic, &message).unwrap();
        assert_eq!(base_topic, actual);
    }

    #[test]
    fn app_properties_are_appended_to_topic_name() {
        let message = Message::builder()
            .set_body(vec![])
            .add_message_property("foo".to_owned(), "bar".to_owned())
            .build();

        let base_topic = TopicName::new("topic/").unwrap();

        let topic_with_properties = build_topic_name(&base_topic, &message).unwrap().to_string();

        assert_eq!("topic/foo=bar", topic_with_properties);
    }

    #[test]
    fn classifies_twin_response_with_version() {
        match matcher().classify("$iothub/twin/res/204/?$rid=9&$version=3") {
            InboundTopic::TwinResponse {
                status,
                request_id,
                version,
            } => {
                assert_eq!(status, 204);
                assert_eq!(request_id, "9");
                assert_eq!(version.as_deref(), Some("3"));
            }
            other => panic!("unexpected classification {:?}", other),
        }
    }

    #[test]
    fn classifies_method_request() {
        match matcher().classify("$iothub/methods/POST/reboot/?$rid=abc") {
            InboundTopic::MethodRequest {
                method_name,
                request_id,
            } => {
                assert_eq!(method_name, "reboot");
                assert_eq!(request_id, "abc");
            }
            other => panic!("unexpected classification {:?}", other),
        }
    }

    #[test]
    fn classifies_device_bound_message() {
        match matcher().classify("devices/dev1/messages/devicebound/%24.mid=1&foo=bar") {
            InboundTopic::DeviceBound { properties } => {
                assert_eq!(properties, "%24.mid=1&foo=bar");
            }
            other => panic!("unexpected classification {:?}", other),
        }
    }

    #[test]
    fn classifies_module_input_event() {
        match matcher().classify("devices/dev1/modules/mod1/inputs/control/%24.mid=2") {
            InboundTopic::InputEvent {
                input_name,
                properties,
            } => {
                assert_eq!(input_name, Some("control"));
                assert_eq!(properties, "%24.mid=2");
            }
            other => panic!("unexpected classification {:?}", other),
        }
    }

    #[test]
    fn unknown_topics_do_not_match() {
        assert!(matches!(
            matcher().classify("$iothub/somethingelse/1"),
            InboundTopic::Unknown
        ));
        assert!(matches!(
            matcher().classify("devices/otherdevice/messages/devicebound/"),
            InboundTopic::Unknown
        ));
    }

    #[test]
    fn outgoing_topics_match_hub_shapes() {
        assert_eq!(
            method_response_topic(200, "fakeResponseId"),
            "$iothub/methods/res/200/?$rid=fakeResponseId"
        );
        assert_eq!(twin_get_topic("7"), "$iothub/twin/GET/?$rid=7");
        assert_eq!(
            twin_update_topic("7"),
            "$iothub/twin/PATCH/properties/reported/?$rid=7"
        );
        assert_eq!(
            module_cloud_bound_messages_topic("dev1", "mod1"),
            "devices/dev1/modules/mod1/messages/events/"
        );
    }

    #[test]
    fn applies_system_property_prefix_convention() {
        let mut message = Message::new(vec![]);
        apply_properties(&mut message, "%24.ct=application%2Fjson&foo=bar&flag");
        assert_eq!(message.system_properties["ct"], "application/json");
        assert_eq!(message.properties["foo"], "bar");
        assert_eq!(message.properties["flag"], "");
    }
}
