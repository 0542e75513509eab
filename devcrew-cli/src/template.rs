//! Project templates: a named starting point plus technology hints that get
//! appended to the description the planner sees.

use clap::ValueEnum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Template {
    /// React frontend with a Flask backend
    WebApp,
    /// REST API with auth and docs
    Api,
    /// Interactive dashboard with charts and live data
    Dashboard,
    /// Cross-platform mobile app
    Mobile,
}

impl Template {
    pub fn name(self) -> &'static str {
        match self {
            Template::WebApp => "Web Application",
            Template::Api => "REST API",
            Template::Dashboard => "Analytics Dashboard",
            Template::Mobile => "Mobile App",
        }
    }

    pub fn technologies(self) -> &'static [&'static str] {
        match self {
            Template::WebApp => &["React", "TypeScript", "Flask", "SQLAlchemy", "CSS3"],
            Template::Api => &["Flask", "SQLAlchemy", "JWT", "Swagger"],
            Template::Dashboard => &["React", "Chart.js", "WebSockets", "Flask", "Redis"],
            Template::Mobile => &["React Native", "TypeScript", "Redux", "Firebase"],
        }
    }

    /// Top-level layout the team should aim for.
    pub fn layout(self) -> &'static [&'static str] {
        match self {
            Template::WebApp => &["frontend/src", "backend/app", "docs"],
            Template::Api => &["app/models", "app/routes", "tests", "docs"],
            Template::Dashboard => &["frontend/src/charts", "backend/app/api", "backend/app/websocket"],
            Template::Mobile => &["src/screens", "src/components", "src/navigation", "src/services"],
        }
    }

    pub fn apply(self, description: &str) -> String {
        format!(
            "{description}\n\nProject type: {}. Preferred technologies: {}. Suggested layout: {}.",
            self.name(),
            self.technologies().join(", "),
            self.layout().join(", ")
        )
    }
}
