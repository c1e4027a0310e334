//! Vehicle inventory read model.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Vehicles per listing page.
pub const PAGE_SIZE: u32 = 21;

/// Listing filters. Empty collections and `None` mean "no constraint".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VehicleFilters {
    pub marca: Vec<String>,
    pub autoano: Vec<i32>,
    pub transmision: Vec<String>,
    pub combustible: Vec<String>,
    pub garantia: Vec<String>,
    pub carroceria: Vec<String>,
    /// Branch names as shown to users (`Monterrey`, `Saltillo`, ...).
    pub ubicacion: Vec<String>,
    pub promociones: Vec<String>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub enganchemin: Option<i64>,
    pub max_enganche: Option<i64>,
    pub hide_separado: bool,
    pub search: Option<String>,
    pub orderby: Option<String>,
}

impl VehicleFilters {
    /// The trimmed search term, if any.
    pub fn search_term(&self) -> Option<&str> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
    }

    /// The trimmed sort order, if any.
    pub fn order_term(&self) -> Option<&str> {
        self.orderby
            .as_deref()
            .map(str::trim)
            .filter(|order| !order.is_empty())
    }

    pub fn sort(&self) -> SortOrder {
        match self.orderby.as_deref().map(str::trim) {
            Some("relevance") => SortOrder::Relevance,
            Some(order) if !order.is_empty() => {
                let (field, direction) = order.split_once('-').unwrap_or((order, ""));
                let column = match field {
                    "price" => "precio",
                    "year" => "autoano",
                    "mileage" => "kilometraje",
                    other => other,
                };
                if column.is_empty()
                    || !column
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
                {
                    return self.default_sort();
                }
                SortOrder::Column {
                    column: column.to_string(),
                    ascending: direction == "asc",
                }
            }
            _ => self.default_sort(),
        }
    }

    fn default_sort(&self) -> SortOrder {
        if self.search_term().is_some() {
            SortOrder::Unordered
        } else {
            SortOrder::Column {
                column: "updated_at".to_string(),
                ascending: false,
            }
        }
    }

    /// Branch codes used by the inventory table for the requested locations.
    pub fn branch_codes(&self) -> Vec<String> {
        self.ubicacion
            .iter()
            .map(|name| branch_code(name).to_string())
            .collect()
    }
}

/// Ordering requested for a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortOrder {
    /// Most viewed first, vehicles without a view count last.
    Relevance,
    Column { column: String, ascending: bool },
    /// Keep the backend's order (search ranking).
    Unordered,
}

/// Map a branch display name onto its inventory code; unknown names pass through.
pub fn branch_code(name: &str) -> &str {
    match name {
        "Monterrey" => "MTY",
        "Guadalupe" => "GPE",
        "Reynosa" => "TMPS",
        "Saltillo" => "COAH",
        other => other,
    }
}

/// One-based page number clamped to at least 1.
pub fn page_range(page: u32) -> (u64, u64) {
    let page = u64::from(page.max(1));
    let from = (page - 1) * u64::from(PAGE_SIZE);
    (from, from + u64::from(PAGE_SIZE) - 1)
}

/// A page of listing rows plus the total number of matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehiclePage {
    pub vehicles: Vec<Value>,
    pub total_count: u64,
}

impl VehiclePage {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Single-value reads against the inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalarQuery {
    FilterOptions,
    VehicleBySlug(String),
    AllSlugs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_maps_friendly_fields() {
        let filters = VehicleFilters {
            orderby: Some("price-asc".into()),
            ..Default::default()
        };
        assert_eq!(
            filters.sort(),
            SortOrder::Column {
                column: "precio".into(),
                ascending: true
            }
        );

        let filters = VehicleFilters {
            orderby: Some("mileage-desc".into()),
            ..Default::default()
        };
        assert_eq!(
            filters.sort(),
            SortOrder::Column {
                column: "kilometraje".into(),
                ascending: false
            }
        );
    }

    #[test]
    fn default_sort_depends_on_search() {
        let plain = VehicleFilters::default();
        assert_eq!(
            plain.sort(),
            SortOrder::Column {
                column: "updated_at".into(),
                ascending: false
            }
        );

        let searching = VehicleFilters {
            search: Some(" jetta ".into()),
            ..Default::default()
        };
        assert_eq!(searching.sort(), SortOrder::Unordered);
        assert_eq!(searching.search_term(), Some("jetta"));
    }

    #[test]
    fn unsafe_sort_columns_fall_back() {
        let filters = VehicleFilters {
            orderby: Some("precio);drop-asc".into()),
            ..Default::default()
        };
        assert_eq!(
            filters.sort(),
            SortOrder::Column {
                column: "updated_at".into(),
                ascending: false
            }
        );
    }

    #[test]
    fn branch_names_map_to_codes() {
        let filters = VehicleFilters {
            ubicacion: vec!["Saltillo".into(), "Cancún".into()],
            ..Default::default()
        };
        assert_eq!(filters.branch_codes(), vec!["COAH", "Cancún"]);
    }

    #[test]
    fn page_range_is_inclusive_and_clamped() {
        assert_eq!(page_range(1), (0, 20));
        assert_eq!(page_range(3), (42, 62));
        assert_eq!(page_range(0), (0, 20));
    }
}
