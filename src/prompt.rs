//! Prompt assembly for the two generation stages.
//!
//! Both builders are pure: identical inputs always produce identical
//! message sequences.

use crate::{
    config::DesignCatalog,
    message::{ContentPart, ImageRef, Message, MessageSequence},
    rules::RuleSet,
};

const ANALYSIS_SYSTEM: &str = "You are a computer vision expert. Your task is to identify all permanent features of a room.";

const ANALYSIS_INSTRUCTION: &str = "In one sentence, describe the room's unchangeable features: wall and floor color/material, and the exact locations of all windows, doors, and fireplaces. Be precise.";

const OBSTRUCTION_DIRECTIVE: &str = "**CRITICAL SAFETY AND FUNCTIONALITY DIRECTIVE:**\n\
Your absolute, non-negotiable highest priority is to **NEVER block doors, entryways, or exits.** \
Placing any furniture, especially large items like a sofa, in front of a door is a critical failure. \
The room analysis provides the ground truth for door locations. You MUST adhere to it strictly.";

const OUTPUT_FORMAT: &str = "**Output Format:**\n\
Your final output MUST be a single, detailed sentence following this exact narrative structure: \
'Place a [detailed material] [primary furniture item] [relative position], accompanied by a matching [secondary furniture item]. \
Add a [distinct object] [spatially related], and use a pair of identical [small lamps/decor] to create symmetry on [a surface]. \
Enhance with [ambient decor] to complement the [color palette or material].'";

/// Room type and style the placement is designed for.
#[derive(Clone, Copy, Debug)]
pub struct DesignBrief<'a> {
    pub room_type: &'a str,
    pub style: &'a str,
}

/// Stage one: ask for a single sentence describing the room's fixed features.
pub fn build_analysis_prompt(image: &ImageRef) -> MessageSequence {
    MessageSequence::new(vec![
        Message::system(ANALYSIS_SYSTEM),
        Message::user(vec![
            ContentPart::Image(image.clone()),
            ContentPart::Text(ANALYSIS_INSTRUCTION.to_string()),
        ]),
    ])
}

/// Stage two: ask for a placement sentence grounded in the stage-one
/// analysis.
pub fn build_placement_prompt(
    brief: DesignBrief<'_>,
    image: &ImageRef,
    analysis: &str,
    catalog: &DesignCatalog,
    rules: &RuleSet,
) -> MessageSequence {
    let DesignBrief { room_type, style } = brief;

    let system = format!(
        "You are an expert interior designer specializing in {style} design. \
         Your primary function is to place furniture in a {room_type} based on an image analysis.\
         \n\n{OBSTRUCTION_DIRECTIVE}\
         \n\n**Design Guidelines:**\n\
         Apply these principles in your design: '{rules}'\
         \n\n{OUTPUT_FORMAT}",
        rules = rules.rules_text(room_type),
    );

    let user = format!(
        "**Ground Truth - Unchangeable Room Features:** \"{analysis}\"\n\n\
         **Task:** Based on the unchangeable room features described in the ground truth, create a furniture plan. \
         **CRITICAL REMINDER:** Do not place any items where they would obstruct the doors or entryways identified in the analysis. \
         Your task is to place the following: {furniture}. Use {style_details} \
         Ensure your layout perfectly fits the existing room. Follow the required sentence structure precisely.",
        furniture = furniture_text(catalog, room_type),
        style_details = style_text(catalog, style),
    );

    MessageSequence::new(vec![
        Message::system(system),
        Message::user(vec![
            ContentPart::Image(image.clone()),
            ContentPart::Text(user),
        ]),
    ])
}

fn furniture_text(catalog: &DesignCatalog, room_type: &str) -> String {
    match catalog.essential_furniture(room_type) {
        Some(items) if !items.is_empty() => format!(
            "Your creative palette of essential furniture for a {room_type} includes: {}",
            items.join(", ")
        ),
        _ => format!(
            "Use your knowledge to determine and incorporate essential furniture for a '{room_type}'."
        ),
    }
}

fn style_text(catalog: &DesignCatalog, style: &str) -> String {
    match catalog.style(style) {
        Some(entry) => format!(
            "materials like {} and a color palette of {}.",
            entry.materials_or_wood(),
            entry.palette()
        ),
        None => "materials and colors appropriate for the style.".to_string(),
    }
}
