use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The rule that outranks every other design directive.
pub const OBSTRUCTION_RULE: &str = "**CRITICAL RULE: Under NO circumstances can any furniture block, cover, or impede access to any doors, entryways, or exits.** This is the most important instruction and must be followed without exception.";

/// Design directives keyed by room type.
///
/// `universal` is always applied and always comes first. `default` replaces
/// the room list when the room type is not known.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RuleSet {
    pub universal: Vec<String>,
    #[serde(default)]
    pub rooms: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub default: Vec<String>,
}

impl RuleSet {
    pub fn standard() -> Self {
        let rooms = [
            (
                "living room",
                &[
                    "Position the main seating (like a sofa) to face a focal point such as a fireplace, TV, or window view.",
                    "Ensure there is space between furniture and walls to create a sense of openness.",
                    "Arrange seating to encourage conversation.",
                    "Use a large area rug to anchor the main furniture group.",
                ][..],
            ),
            (
                "bedroom",
                &[
                    "The bed should be on the main wall, ideally the one you see upon entering.",
                    "Place matching nightstands on both sides of the bed for balance and function.",
                    "Avoid obstructing windows with large furniture like wardrobes or dressers.",
                    "The overall layout should feel uncluttered and promote a sense of calm.",
                ][..],
            ),
            (
                "kitchen",
                &[
                    "The refrigerator, sink, and stove should form a classic work triangle for efficiency.",
                    "Countertops should remain mostly clear, reserved for daily-use appliances.",
                ][..],
            ),
            (
                "dining room",
                &[
                    "Center the dining table directly under the main light fixture.",
                    "Ensure at least 3 feet of clearance around the table for chairs to be pulled out comfortably.",
                ][..],
            ),
        ]
        .into_iter()
        .map(|(room, rules)| {
            (
                room.to_string(),
                rules.iter().map(|rule| rule.to_string()).collect(),
            )
        })
        .collect();

        Self {
            universal: vec![OBSTRUCTION_RULE.to_string()],
            rooms,
            default: [
                "Ensure all major pathways are at least 3 feet wide for clear movement.",
                "Group furniture to create functional, defined zones.",
                "Do not block natural light sources.",
                "Balance the visual weight of furniture throughout the room.",
            ]
            .iter()
            .map(|rule| rule.to_string())
            .collect(),
        }
    }

    /// Universal rules followed by the rules for `room_type`, or by the
    /// default rules when the room type is unknown.
    pub fn rules_for(&self, room_type: &str) -> Vec<&str> {
        let specific = self.rooms.get(room_type).unwrap_or(&self.default);
        self.universal
            .iter()
            .chain(specific)
            .map(String::as_str)
            .collect()
    }

    pub fn rules_text(&self, room_type: &str) -> String {
        self.rules_for(room_type).join(" ")
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::standard()
    }
}
