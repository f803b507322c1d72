use image::RgbImage;
use std::sync::Arc;

use crate::image_input::ValidatedImage;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    System,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
        }
    }
}

/// Shared reference to a validated image. Cloning never copies pixels.
#[derive(Clone, Debug)]
pub struct ImageRef(Arc<ValidatedImage>);

impl ImageRef {
    pub fn new(image: ValidatedImage) -> Self {
        Self(Arc::new(image))
    }

    pub fn pixels(&self) -> &RgbImage {
        self.0.pixels()
    }

    pub fn same_image(&self, other: &ImageRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Clone, Debug)]
pub enum ContentPart {
    Text(String),
    Image(ImageRef),
}

impl ContentPart {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text(text) => Some(text),
            ContentPart::Image(_) => None,
        }
    }

    pub fn as_image(&self) -> Option<&ImageRef> {
        match self {
            ContentPart::Image(image) => Some(image),
            ContentPart::Text(_) => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Message {
    role: Role,
    content: Vec<ContentPart>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentPart::Text(text.into())],
        }
    }

    pub fn user(content: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &[ContentPart] {
        &self.content
    }

    /// All text parts joined in order.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn images(&self) -> impl Iterator<Item = &ImageRef> {
        self.content.iter().filter_map(ContentPart::as_image)
    }
}

/// Ordered conversation handed to the model in a single generation call.
#[derive(Clone, Debug)]
pub struct MessageSequence {
    messages: Vec<Message>,
}

impl MessageSequence {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn system(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.role == Role::System)
    }

    pub fn first_user(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.role == Role::User)
    }

    /// Appends a caller note to the first text part of the first user turn.
    ///
    /// The note is appended verbatim; only an empty note is skipped.
    pub fn with_note(mut self, note: Option<&str>) -> Self {
        let Some(note) = note.filter(|n| !n.is_empty()) else {
            return self;
        };
        let text = self
            .messages
            .iter_mut()
            .find(|m| m.role == Role::User)
            .and_then(|m| {
                m.content.iter_mut().find_map(|part| match part {
                    ContentPart::Text(text) => Some(text),
                    ContentPart::Image(_) => None,
                })
            });
        if let Some(text) = text {
            text.push_str("\n\n**Very Important Note:** ");
            text.push_str(note);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_input::ImageResolver;
    use image::{DynamicImage, Rgb};

    fn image_ref() -> ImageRef {
        let pixels = RgbImage::from_pixel(400, 400, Rgb([1, 2, 3]));
        ImageRef::new(
            ImageResolver::default()
                .validate(DynamicImage::ImageRgb8(pixels))
                .unwrap(),
        )
    }

    fn sequence(image: &ImageRef) -> MessageSequence {
        MessageSequence::new(vec![
            Message::system("You are a designer."),
            Message::user(vec![
                ContentPart::Image(image.clone()),
                ContentPart::Text("Place the sofa.".to_string()),
            ]),
        ])
    }

    #[test]
    fn test_note_is_appended_to_user_text() {
        let image = image_ref();
        let messages = sequence(&image).with_note(Some("Keep the piano."));

        let user = messages.first_user().unwrap();
        assert_eq!(
            user.text(),
            "Place the sofa.\n\n**Very Important Note:** Keep the piano."
        );
        assert_eq!(user.content().len(), 2);
        assert!(user.content()[0].as_image().unwrap().same_image(&image));
        assert_eq!(messages.system().unwrap().text(), "You are a designer.");
    }

    #[test]
    fn test_empty_note_leaves_sequence_unchanged() {
        let image = image_ref();
        for note in [None, Some("")] {
            let messages = sequence(&image).with_note(note);
            assert_eq!(messages.first_user().unwrap().text(), "Place the sofa.");
        }
    }

    #[test]
    fn test_note_is_appended_verbatim() {
        let image = image_ref();

        let messages = sequence(&image).with_note(Some("  no rugs \n"));
        assert_eq!(
            messages.first_user().unwrap().text(),
            "Place the sofa.\n\n**Very Important Note:**   no rugs \n"
        );

        let messages = sequence(&image).with_note(Some("   "));
        assert_eq!(
            messages.first_user().unwrap().text(),
            "Place the sofa.\n\n**Very Important Note:**    "
        );
    }

    #[test]
    fn test_images_are_shared() {
        let image = image_ref();
        let messages = sequence(&image);
        let images: Vec<_> = messages.first_user().unwrap().images().collect();
        assert_eq!(images.len(), 1);
        assert!(images[0].same_image(&image));
        assert_eq!(Role::User.as_str(), "user");
    }
}
