//! Geographic source addresses.
//!
//! A [`RegionTable`] maps a region name to the IPv4 ranges allocated there and
//! to the countries and cities that make up the region. Picking from a region
//! yields a client address and a [`Geocode`] describing where that client
//! "is". The address and the city are drawn independently: they agree on the
//! region and nothing finer.

use std::net::Ipv4Addr;

use rand::{Rng, seq::IndexedRandom};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Latitude and longitude of a city.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Location {
    /// Degrees north of the equator.
    pub lat: f64,
    /// Degrees east of the prime meridian.
    pub lon: f64,
}

/// Location metadata attached to a generated client address.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Geocode {
    /// Coordinates of `city_name`.
    pub location: Location,
    /// Two-letter ISO 3166 country code.
    pub country_iso_code: String,
    /// Human readable country name.
    pub country_name: String,
    /// Human readable city name.
    pub city_name: String,
}

/// A city inside a [`Country`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct City {
    /// City name.
    pub name: String,
    /// Latitude of the city.
    pub lat: f64,
    /// Longitude of the city.
    pub lon: f64,
}

/// A country inside a [`Region`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Country {
    /// Country name.
    pub name: String,
    /// Two-letter ISO 3166 code.
    #[serde(default)]
    pub code: String,
    /// Cities clients may be placed in. A country without cities is dropped
    /// when the table is built.
    #[serde(default)]
    pub cities: Vec<City>,
}

/// An inclusive range of IPv4 addresses, `start` through `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IpRange {
    /// First address of the range.
    pub start: Ipv4Addr,
    /// Last address of the range.
    pub end: Ipv4Addr,
}

impl IpRange {
    /// Draw an address from this range.
    ///
    /// The first three octets are drawn independently between the per-octet
    /// bounds of `start` and `end`. The last octet is drawn from `[1, 254]`
    /// regardless of the range, keeping clear of network and broadcast
    /// addresses.
    pub fn sample<R>(&self, rng: &mut R) -> Ipv4Addr
    where
        R: Rng + ?Sized,
    {
        let start = self.start.octets();
        let end = self.end.octets();
        let mut octets = [0_u8; 4];
        for (idx, octet) in octets.iter_mut().take(3).enumerate() {
            let low = start[idx].min(end[idx]);
            let high = start[idx].max(end[idx]);
            *octet = rng.random_range(low..=high);
        }
        octets[3] = rng.random_range(1..=254);
        Ipv4Addr::from(octets)
    }

    /// Whether `addr` could have been produced by [`IpRange::sample`].
    #[must_use]
    pub fn admits(&self, addr: Ipv4Addr) -> bool {
        let start = self.start.octets();
        let end = self.end.octets();
        let octets = addr.octets();
        let prefix_ok = (0..3).all(|idx| {
            let low = start[idx].min(end[idx]);
            let high = start[idx].max(end[idx]);
            (low..=high).contains(&octets[idx])
        });
        prefix_ok && (1..=254).contains(&octets[3])
    }
}

/// A named network region.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Region {
    /// Region name, for instance "Europe".
    pub name: String,
    /// Address ranges allocated to the region.
    #[serde(default)]
    pub ranges: Vec<IpRange>,
    /// Countries that make up the region.
    #[serde(default)]
    pub countries: Vec<Country>,
}

impl Region {
    /// Draw a client address and its geocode from this region.
    ///
    /// # Panics
    ///
    /// Function will panic if the region has no ranges, countries or cities.
    /// [`RegionTable`] never holds such a region.
    pub fn pick<R>(&self, rng: &mut R) -> (Ipv4Addr, Geocode)
    where
        R: Rng + ?Sized,
    {
        let range = self
            .ranges
            .choose(rng)
            .expect("region validated to hold at least one range");
        let addr = range.sample(rng);

        let country = self
            .countries
            .choose(rng)
            .expect("region validated to hold at least one country");
        let city = country
            .cities
            .choose(rng)
            .expect("country validated to hold at least one city");

        let geocode = Geocode {
            location: Location {
                lat: city.lat,
                lon: city.lon,
            },
            country_iso_code: country.code.clone(),
            country_name: country.name.clone(),
            city_name: city.name.clone(),
        };
        (addr, geocode)
    }

    /// Whether `addr` falls in any range of this region.
    #[must_use]
    pub fn admits(&self, addr: Ipv4Addr) -> bool {
        self.ranges.iter().any(|range| range.admits(addr))
    }

    /// Drop countries without cities, then report whether the region is
    /// usable at all.
    fn validate(&mut self) -> bool {
        let before = self.countries.len();
        self.countries.retain(|country| !country.cities.is_empty());
        if self.countries.len() != before {
            warn!(
                region = %self.name,
                "dropped {} countries without cities",
                before - self.countries.len()
            );
        }
        if self.ranges.is_empty() {
            warn!(region = %self.name, "region has no IP ranges, dropping");
            return false;
        }
        if self.countries.is_empty() {
            warn!(region = %self.name, "region has no usable countries, dropping");
            return false;
        }
        true
    }
}

/// The static lookup of regions.
///
/// Invariant: the table holds at least one region, every region holds at
/// least one range and one country, every country at least one city.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionTable {
    regions: Vec<Region>,
}

impl Default for RegionTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RegionTable {
    /// Build a table from user supplied regions.
    ///
    /// Regions that break the table invariant are dropped with a warning. If
    /// nothing usable remains the built-in table is returned instead.
    #[must_use]
    pub fn from_regions(regions: Vec<Region>) -> Self {
        let regions: Vec<Region> = regions
            .into_iter()
            .filter_map(|mut region| region.validate().then_some(region))
            .collect();
        if regions.is_empty() {
            warn!("no usable regions configured, falling back to built-in region table");
            return Self::builtin();
        }
        Self { regions }
    }

    /// The built-in six region table.
    #[must_use]
    pub fn builtin() -> Self {
        let regions = BUILTIN
            .iter()
            .map(|region| Region {
                name: region.name.to_string(),
                ranges: region
                    .ranges
                    .iter()
                    .map(|(start, end)| IpRange {
                        start: Ipv4Addr::from(*start),
                        end: Ipv4Addr::from(*end),
                    })
                    .collect(),
                countries: region
                    .countries
                    .iter()
                    .map(|country| Country {
                        name: country.name.to_string(),
                        code: country.code.to_string(),
                        cities: country
                            .cities
                            .iter()
                            .map(|(name, lat, lon)| City {
                                name: (*name).to_string(),
                                lat: *lat,
                                lon: *lon,
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();
        Self { regions }
    }

    /// Names of every region in table order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.regions.iter().map(|region| region.name.as_str())
    }

    /// Look a region up by exact name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Region> {
        self.regions.iter().find(|region| region.name == name)
    }

    /// Resolve `name` to a region. Unknown or absent names resolve to a
    /// uniformly chosen region.
    ///
    /// # Panics
    ///
    /// None known, the table is never empty.
    pub fn region<R>(&self, rng: &mut R, name: Option<&str>) -> &Region
    where
        R: Rng + ?Sized,
    {
        match name.and_then(|name| self.get(name)) {
            Some(region) => region,
            None => self
                .regions
                .choose(rng)
                .expect("region table is never empty"),
        }
    }

    /// Draw a client address and geocode from `name`, or from a uniformly
    /// chosen region when `name` is absent or unknown.
    pub fn pick<R>(&self, rng: &mut R, name: Option<&str>) -> (Ipv4Addr, Geocode)
    where
        R: Rng + ?Sized,
    {
        self.region(rng, name).pick(rng)
    }
}

struct StaticCountry {
    name: &'static str,
    code: &'static str,
    cities: &'static [(&'static str, f64, f64)],
}

struct StaticRegion {
    name: &'static str,
    ranges: &'static [([u8; 4], [u8; 4])],
    countries: &'static [StaticCountry],
}

const fn slash8(first: u8) -> ([u8; 4], [u8; 4]) {
    ([first, 0, 0, 0], [first, 255, 255, 255])
}

const BUILTIN: [StaticRegion; 6] = [
    StaticRegion {
        name: "Europe",
        ranges: &[
            ([2, 16, 0, 0], [2, 31, 255, 255]),
            slash8(5),
            slash8(31),
            slash8(37),
            slash8(46),
            slash8(62),
            slash8(78),
            slash8(80),
            slash8(82),
            slash8(88),
        ],
        countries: &[
            StaticCountry {
                name: "United Kingdom",
                code: "GB",
                cities: &[
                    ("London", 51.5074, -0.1278),
                    ("Manchester", 53.4808, -2.2426),
                    ("Birmingham", 52.4862, -1.8904),
                ],
            },
            StaticCountry {
                name: "Germany",
                code: "DE",
                cities: &[
                    ("Berlin", 52.5200, 13.4050),
                    ("Munich", 48.1351, 11.5820),
                    ("Frankfurt", 50.1109, 8.6821),
                ],
            },
            StaticCountry {
                name: "France",
                code: "FR",
                cities: &[
                    ("Paris", 48.8566, 2.3522),
                    ("Lyon", 45.7640, 4.8357),
                    ("Marseille", 43.2965, 5.3698),
                ],
            },
        ],
    },
    StaticRegion {
        name: "Asia",
        ranges: &[
            slash8(1),
            slash8(14),
            slash8(27),
            slash8(36),
            slash8(42),
            slash8(58),
            slash8(103),
            slash8(110),
            slash8(116),
            slash8(125),
        ],
        countries: &[
            StaticCountry {
                name: "Japan",
                code: "JP",
                cities: &[
                    ("Tokyo", 35.6762, 139.6503),
                    ("Osaka", 34.6937, 135.5023),
                    ("Kyoto", 35.0116, 135.7681),
                ],
            },
            StaticCountry {
                name: "China",
                code: "CN",
                cities: &[
                    ("Beijing", 39.9042, 116.4074),
                    ("Shanghai", 31.2304, 121.4737),
                    ("Shenzhen", 22.5431, 114.0579),
                ],
            },
            StaticCountry {
                name: "India",
                code: "IN",
                cities: &[
                    ("Mumbai", 19.0760, 72.8777),
                    ("Delhi", 28.7041, 77.1025),
                    ("Bangalore", 12.9716, 77.5946),
                ],
            },
        ],
    },
    StaticRegion {
        name: "South America",
        ranges: &[
            slash8(177),
            slash8(179),
            slash8(181),
            slash8(186),
            slash8(189),
            slash8(190),
            slash8(191),
            slash8(200),
            slash8(201),
            slash8(187),
        ],
        countries: &[
            StaticCountry {
                name: "Brazil",
                code: "BR",
                cities: &[
                    ("São Paulo", -23.5505, -46.6333),
                    ("Rio de Janeiro", -22.9068, -43.1729),
                    ("Brasília", -15.8267, -47.9218),
                ],
            },
            StaticCountry {
                name: "Argentina",
                code: "AR",
                cities: &[
                    ("Buenos Aires", -34.6037, -58.3816),
                    ("Córdoba", -31.4201, -64.1888),
                    ("Rosario", -32.9442, -60.6505),
                ],
            },
            StaticCountry {
                name: "Colombia",
                code: "CO",
                cities: &[
                    ("Bogotá", 4.7110, -74.0721),
                    ("Medellín", 6.2476, -75.5658),
                    ("Cali", 3.4516, -76.5320),
                ],
            },
        ],
    },
    StaticRegion {
        name: "Africa",
        ranges: &[
            slash8(41),
            slash8(102),
            slash8(105),
            slash8(154),
            slash8(196),
            slash8(197),
            slash8(129),
            slash8(155),
            slash8(160),
            slash8(169),
        ],
        countries: &[
            StaticCountry {
                name: "South Africa",
                code: "ZA",
                cities: &[
                    ("Johannesburg", -26.2041, 28.0473),
                    ("Cape Town", -33.9249, 18.4241),
                    ("Durban", -29.8587, 31.0218),
                ],
            },
            StaticCountry {
                name: "Nigeria",
                code: "NG",
                cities: &[
                    ("Lagos", 6.5244, 3.3792),
                    ("Abuja", 9.0765, 7.3986),
                    ("Kano", 12.0022, 8.5920),
                ],
            },
            StaticCountry {
                name: "Egypt",
                code: "EG",
                cities: &[
                    ("Cairo", 30.0444, 31.2357),
                    ("Alexandria", 31.2001, 29.9187),
                    ("Giza", 30.0131, 31.2089),
                ],
            },
        ],
    },
    StaticRegion {
        name: "Australia",
        ranges: &[
            ([1, 128, 0, 0], [1, 159, 255, 255]),
            ([27, 32, 0, 0], [27, 47, 255, 255]),
            slash8(49),
            slash8(101),
            slash8(203),
        ],
        countries: &[StaticCountry {
            name: "Australia",
            code: "AU",
            cities: &[
                ("Sydney", -33.8688, 151.2093),
                ("Melbourne", -37.8136, 144.9631),
                ("Brisbane", -27.4698, 153.0251),
            ],
        }],
    },
    StaticRegion {
        name: "North America",
        ranges: &[slash8(8), slash8(12), slash8(24), slash8(50), slash8(66)],
        countries: &[
            StaticCountry {
                name: "United States",
                code: "US",
                cities: &[
                    ("New York", 40.7128, -74.0060),
                    ("Los Angeles", 34.0522, -118.2437),
                    ("Chicago", 41.8781, -87.6298),
                    ("San Francisco", 37.7749, -122.4194),
                ],
            },
            StaticCountry {
                name: "Canada",
                code: "CA",
                cities: &[
                    ("Toronto", 43.6532, -79.3832),
                    ("Vancouver", 49.2827, -123.1207),
                    ("Montreal", 45.5017, -73.5673),
                ],
            },
        ],
    },
];

#[cfg(test)]
mod test {
    use proptest::prelude::*;
    use rand::{SeedableRng, rngs::SmallRng};

    use super::*;

    #[test]
    fn builtin_table_upholds_invariant() {
        let table = RegionTable::builtin();
        assert_eq!(table.names().count(), 6);
        for region in &table.regions {
            assert!(!region.ranges.is_empty(), "{} has no ranges", region.name);
            assert!(!region.countries.is_empty());
            for country in &region.countries {
                assert!(!country.cities.is_empty());
                assert_eq!(country.code.len(), 2);
            }
        }
    }

    #[test]
    fn invalid_regions_are_dropped() {
        let mut table = RegionTable::builtin().regions;
        table[0].ranges.clear();
        table[1].countries.iter_mut().for_each(|c| c.cities.clear());
        table[2].countries[0].cities.clear();

        let table = RegionTable::from_regions(table);
        let names: Vec<&str> = table.names().collect();
        assert!(!names.contains(&"Europe"));
        assert!(!names.contains(&"Asia"));
        assert!(names.contains(&"South America"));
        let south_america = table.get("South America").expect("region kept");
        assert_eq!(south_america.countries.len(), 2);
    }

    #[test]
    fn empty_configuration_falls_back_to_builtin() {
        let table = RegionTable::from_regions(Vec::new());
        assert_eq!(table, RegionTable::builtin());
    }

    #[test]
    fn backwards_range_still_samples() {
        let range = IpRange {
            start: Ipv4Addr::new(10, 200, 3, 0),
            end: Ipv4Addr::new(10, 100, 1, 255),
        };
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..1_000 {
            let addr = range.sample(&mut rng);
            assert!(range.admits(addr), "{addr}");
        }
    }

    proptest! {
        #[test]
        fn pick_stays_inside_named_region(seed: u64, idx in 0_usize..6) {
            let mut rng = SmallRng::seed_from_u64(seed);
            let table = RegionTable::builtin();
            let name = table.names().nth(idx).expect("six regions").to_string();
            let region = table.get(&name).expect("region exists");

            let (addr, geocode) = table.pick(&mut rng, Some(&name));
            prop_assert!(region.admits(addr), "{addr} not in {name}");
            prop_assert!((1..=254).contains(&addr.octets()[3]));
            let country = region
                .countries
                .iter()
                .find(|c| c.name == geocode.country_name);
            prop_assert!(country.is_some());
            let country = country.expect("checked above");
            prop_assert!(country.cities.iter().any(|c| c.name == geocode.city_name));
        }

        #[test]
        fn unknown_region_still_yields_valid_pair(seed: u64, name in "[a-z ]{0,12}") {
            let mut rng = SmallRng::seed_from_u64(seed);
            let table = RegionTable::builtin();

            let (addr, geocode) = table.pick(&mut rng, Some(&name));
            let owner = table.regions.iter().find(|r| r.admits(addr));
            prop_assert!(owner.is_some(), "{addr} outside every region");
            prop_assert!(!geocode.country_name.is_empty());
            prop_assert!(!geocode.city_name.is_empty());
        }
    }
}
