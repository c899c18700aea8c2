//! Edge extraction from relationship aspect payloads.
//!
//! Three payload shapes are understood:
//! - `childItems[]` with `catenaXId` (bill of materials, current models)
//! - `childParts[]` with `childCatenaXId` (legacy assembly part relationship)
//! - `parentItems[]` with `catenaXId` (usage models, edges point at the node)

use serde_json::Value;

use irs_shared::{GlobalAssetId, IrsError, Quantity, RelationshipEdge, Result};

/// Read every relationship edge of `node` from a validated aspect payload.
pub fn parse_edges(node: &GlobalAssetId, aspect_type: &str, payload: &Value) -> Result<Vec<RelationshipEdge>> {
    let mut edges = Vec::new();

    for (list, id_field) in [("childItems", "catenaXId"), ("childParts", "childCatenaXId")] {
        for (index, item) in items(payload, list).iter().enumerate() {
            let child = related_id(item, id_field, list, index)?;
            edges.push(edge(node.clone(), child, aspect_type, item));
        }
    }

    for (index, item) in items(payload, "parentItems").iter().enumerate() {
        let parent = related_id(item, "catenaXId", "parentItems", index)?;
        edges.push(edge(parent, node.clone(), aspect_type, item));
    }

    Ok(edges)
}

fn items<'a>(payload: &'a Value, list: &str) -> &'a [Value] {
    payload
        .get(list)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn related_id(item: &Value, field: &str, list: &str, index: usize) -> Result<GlobalAssetId> {
    item.get(field)
        .and_then(Value::as_str)
        .map(GlobalAssetId::from_payload)
        .ok_or_else(|| IrsError::validation(format!("{list}[{index}] has no '{field}'")))
}

fn edge(parent: GlobalAssetId, child: GlobalAssetId, aspect_type: &str, item: &Value) -> RelationshipEdge {
    let mut edge = RelationshipEdge::new(parent, child, aspect_type);
    edge.lifecycle_context = item
        .get("lifecycleContext")
        .and_then(Value::as_str)
        .map(str::to_string);
    edge.quantity = item.get("quantity").and_then(quantity);
    edge
}

/// `measurementUnit` is a plain string in current models and an object with
/// `lexicalValue` in older ones.
fn quantity(value: &Value) -> Option<Quantity> {
    let quantity_number = value
        .get("quantityNumber")
        .or_else(|| value.get("value"))
        .and_then(Value::as_f64)?;
    let measurement_unit = value.get("measurementUnit").and_then(|unit| match unit {
        Value::String(s) => Some(s.clone()),
        Value::Object(o) => o.get("lexicalValue").and_then(Value::as_str).map(str::to_string),
        _ => None,
    });
    Some(Quantity {
        quantity_number,
        measurement_unit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node() -> GlobalAssetId {
        GlobalAssetId::from_payload("urn:uuid:00000000-0000-0000-0000-000000000001")
    }

    #[test]
    fn child_items_become_downward_edges() {
        let payload = json!({
            "catenaXId": node().as_str(),
            "childItems": [{
                "catenaXId": "urn:uuid:2",
                "lifecycleContext": "asBuilt",
                "quantity": { "quantityNumber": 2.5, "measurementUnit": "unit:litre" }
            }]
        });
        let edges = parse_edges(&node(), "SingleLevelBomAsBuilt", &payload).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].parent_id, node());
        assert_eq!(edges[0].child_id.as_str(), "urn:uuid:2");
        assert_eq!(edges[0].lifecycle_context.as_deref(), Some("asBuilt"));
        let quantity = edges[0].quantity.as_ref().unwrap();
        assert_eq!(quantity.quantity_number, 2.5);
        assert_eq!(quantity.measurement_unit.as_deref(), Some("unit:litre"));
    }

    #[test]
    fn legacy_child_parts_with_unit_object() {
        let payload = json!({
            "childParts": [{
                "childCatenaXId": "urn:uuid:3",
                "quantity": { "quantityNumber": 1, "measurementUnit": { "lexicalValue": "piece" } }
            }]
        });
        let edges = parse_edges(&node(), "AssemblyPartRelationship", &payload).unwrap();
        assert_eq!(edges[0].child_id.as_str(), "urn:uuid:3");
        assert_eq!(
            edges[0].quantity.as_ref().unwrap().measurement_unit.as_deref(),
            Some("piece")
        );
    }

    #[test]
    fn parent_items_point_at_node() {
        let payload = json!({ "parentItems": [{ "catenaXId": "urn:uuid:9" }] });
        let edges = parse_edges(&node(), "SingleLevelUsageAsBuilt", &payload).unwrap();
        assert_eq!(edges[0].parent_id.as_str(), "urn:uuid:9");
        assert_eq!(edges[0].child_id, node());
    }

    #[test]
    fn item_without_id_is_rejected() {
        let payload = json!({ "childItems": [{ "catenaXId": "urn:uuid:2" }, { "quantity": {} }] });
        let err = parse_edges(&node(), "SingleLevelBomAsBuilt", &payload).unwrap_err();
        assert!(err.to_string().contains("childItems[1]"));
    }

    #[test]
    fn empty_payload_has_no_edges() {
        assert!(parse_edges(&node(), "SingleLevelBomAsBuilt", &json!({})).unwrap().is_empty());
    }
}
