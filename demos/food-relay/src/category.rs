/// Kind of food a producer route publishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    Fruit,
    Greens,
}

impl Category {
    /// Map a request path to its category.
    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            "/fruits" => Some(Category::Fruit),
            "/greens" => Some(Category::Greens),
            _ => None,
        }
    }

    /// Routing key the message is published with.
    pub fn routing_key(self) -> &'static str {
        match self {
            Category::Fruit => "fruit",
            Category::Greens => "greens",
        }
    }

    /// Name of the span started when the request arrives.
    pub fn span_name(self) -> &'static str {
        match self {
            Category::Fruit => "event received",
            Category::Greens => "Producer",
        }
    }

    /// Value of the `type` attribute on the request span.
    pub fn span_type(self) -> &'static str {
        match self {
            Category::Fruit => "fruit",
            Category::Greens => "veggies",
        }
    }

    /// Value of the `producer` baggage entry sent along with the message.
    pub fn producer(self) -> &'static str {
        match self {
            Category::Fruit => "fruit",
            Category::Greens => "green",
        }
    }
}
