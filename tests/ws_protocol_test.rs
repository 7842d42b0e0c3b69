// Protocol-level properties of the diff stream: applying every upsert and
// delete from a transcript onto an empty snapshot reproduces the current
// view, and the wire encoding matches what browser clients parse.

use miniflightradar::ws::{ClientMessage, FlightItem, ServerMessage, compute_diff, item_key};
use std::collections::HashMap;

fn item(icao: &str, callsign: &str, lon: f64, lat: f64, ts: i64) -> FlightItem {
    FlightItem {
        icao24: icao.to_string(),
        callsign: callsign.to_string(),
        lon,
        lat,
        alt: 10000.0,
        track: 270.0,
        speed: 220.0,
        ts,
        trail: Vec::new(),
    }
}

fn keyed(items: &[FlightItem]) -> HashMap<String, FlightItem> {
    items.iter().map(|i| (item_key(i), i.clone())).collect()
}

fn apply(client: &mut HashMap<String, FlightItem>, upsert: &[FlightItem], delete: &[String]) {
    for item in upsert {
        client.insert(item_key(item), item.clone());
    }
    for key in delete {
        client.remove(key);
    }
}

#[test]
fn transcript_replay_reproduces_every_view() {
    // a sequence of server-side views as the fleet evolves
    let views = vec![
        keyed(&[item("a1", "AAL1", -100.0, 40.0, 10)]),
        keyed(&[
            item("a1", "AAL1", -99.5, 40.2, 20),
            item("b2", "BAW2", 0.0, 51.0, 20),
        ]),
        keyed(&[
            item("a1", "AAL1", -99.0, 40.4, 30),
            item("b2", "BAW2", 0.1, 51.1, 30),
            item("", "GLIDER7", 8.0, 47.0, 30),
        ]),
        // b2 expires from the view
        keyed(&[
            item("a1", "AAL1", -98.5, 40.6, 40),
            item("", "GLIDER7", 8.0, 47.0, 30),
        ]),
        keyed(&[]),
    ];

    let mut last: HashMap<String, FlightItem> = HashMap::new();
    let mut client: HashMap<String, FlightItem> = HashMap::new();

    for view in views {
        let (upsert, delete) = compute_diff(&last, &view);
        apply(&mut client, &upsert, &delete);
        assert_eq!(client, view, "client snapshot diverged from server view");
        last = view;
    }
    assert!(client.is_empty());
}

#[test]
fn unchanged_items_never_reappear_in_diffs() {
    let view = keyed(&[
        item("a1", "AAL1", -100.0, 40.0, 10),
        item("b2", "BAW2", 0.0, 51.0, 10),
    ]);
    let (initial, _) = compute_diff(&HashMap::new(), &view);
    assert_eq!(initial.len(), 2);

    // same view again: the diff is empty both ways
    let (upsert, delete) = compute_diff(&view, &view.clone());
    assert!(upsert.is_empty());
    assert!(delete.is_empty());
}

#[test]
fn callsign_keyed_items_delete_by_callsign() {
    let view = keyed(&[item("", "glider7", 8.0, 47.0, 10)]);
    // keys are normalised callsigns when no transponder id exists
    assert!(view.contains_key("GLIDER7"));

    let (_, delete) = compute_diff(&view, &HashMap::new());
    assert_eq!(delete, vec!["GLIDER7".to_string()]);
}

#[test]
fn wire_shapes_match_client_expectations() {
    let diff = ServerMessage::Diff {
        seq: 2,
        upsert: vec![item("a1", "AAL1", -100.0, 40.0, 10)],
        delete: vec![],
    };
    let encoded = serde_json::to_string(&diff).unwrap();
    let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
    assert_eq!(value["type"], "diff");
    assert_eq!(value["upsert"][0]["callsign"], "AAL1");
    assert_eq!(value["delete"].as_array().unwrap().len(), 0);

    // what the browser sends back
    let ack: ClientMessage =
        serde_json::from_str(r#"{"type":"ack","seq":2,"buffered":0}"#).unwrap();
    assert!(matches!(ack, ClientMessage::Ack { seq: 2, buffered: 0 }));
    let viewport: ClientMessage =
        serde_json::from_str(r#"{"type":"viewport","bbox":"-10,35,10,55"}"#).unwrap();
    assert!(matches!(viewport, ClientMessage::Viewport { .. }));
}
