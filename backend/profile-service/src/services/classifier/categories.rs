/// A reference category and the keywords embedded alongside its name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryDef {
    pub name: &'static str,
    pub description: &'static str,
}

/// Stable enumeration order; the index is the point id of the reference vector
pub const CATEGORIES: [CategoryDef; 17] = [
    CategoryDef {
        name: "Politics",
        description: "government president parliament prime minister cabinet election party diplomacy defense security policy constitution corruption",
    },
    CategoryDef {
        name: "Society",
        description: "labor human rights welfare crime police prosecution trial incidents accidents safety disaster protest conflict unemployment",
    },
    CategoryDef {
        name: "Economy",
        description: "economy finance stocks investment companies industry trade real estate construction prices exchange rate employment trade agreement startup",
    },
    CategoryDef {
        name: "Technology",
        description: "IT artificial intelligence software hardware semiconductor data telecommunications robotics cybersecurity blockchain cloud startup metaverse 5G",
    },
    CategoryDef {
        name: "Science",
        description: "science physics chemistry life science earth science astronomy space research experiment genetics medical research climate science new materials",
    },
    CategoryDef {
        name: "Health",
        description: "health disease medicine hospital pharmaceuticals vaccine nutrition exercise mental health public health prevention diet",
    },
    CategoryDef {
        name: "Education",
        description: "education school university admissions entrance exam teacher student academy lifelong learning online learning scholarship textbook education policy",
    },
    CategoryDef {
        name: "Culture",
        description: "culture literature art performance exhibition traditional culture fine art film festival language festival creation artist",
    },
    CategoryDef {
        name: "Entertainment",
        description: "celebrities movies drama music K-pop idols broadcasting variety shows games webtoons OTT fandom stars",
    },
    CategoryDef {
        name: "Sports",
        description: "sports soccer baseball basketball volleyball golf Olympics World Cup esports athletics tennis marathon team",
    },
    CategoryDef {
        name: "History",
        description: "history national history world history ancient history modern history archaeology historical figures war history cultural heritage history education independence movement ruins",
    },
    CategoryDef {
        name: "Environment",
        description: "environment climate change carbon neutrality recycling energy air pollution water pollution ecosystem natural disaster environmental policy fine dust eco-friendly sustainability",
    },
    CategoryDef {
        name: "Travel",
        description: "travel tourism domestic travel overseas travel hotel airline transportation restaurants travel reviews travel information backpacking attractions",
    },
    CategoryDef {
        name: "Lifestyle",
        description: "living cooking fashion beauty interior pets hobbies exercise gardening lifestyle consumption shopping services",
    },
    CategoryDef {
        name: "Family",
        description: "family dating marriage newlyweds parenting child education family relationships couples parents teenagers housework caregiving",
    },
    CategoryDef {
        name: "Religion",
        description: "religion Christianity Buddhism Catholicism Islam religious events religious conflict faith meditation spirituality temple church",
    },
    CategoryDef {
        name: "Philosophy",
        description: "philosophy ethics humanities political philosophy social philosophy eastern philosophy western philosophy values morality thought philosophers truth",
    },
];
